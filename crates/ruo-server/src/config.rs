// config.rs — server configuration and defaults

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// One row of the 0xA8 game server list.
#[derive(Debug, Clone)]
pub struct GameServerInfo {
    pub name: String,
    pub address: Ipv4Addr,
    pub port: u16,
    pub timezone: u8,
    pub full_percent: u8,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub endpoints: Vec<SocketAddr>,
    pub tick_ms: u64,
    /// 0 resolves to processors - 1 at save time.
    pub save_parallelism: usize,
    pub background_flush: bool,
    pub save_root: PathBuf,

    pub gump_cap: usize,
    pub hue_picker_cap: usize,
    pub menu_cap: usize,
    pub secure_trade_cap: usize,

    pub coalesce_buffer_size: usize,

    /// Feature bits for the 0xB9 supported-features packet.
    pub supported_features: u32,
    /// Flag word for the 0xA9 character list.
    pub character_list_flags: u32,

    pub servers: Vec<GameServerInfo>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["0.0.0.0:2593".parse().unwrap()],
            tick_ms: 50,
            save_parallelism: 0,
            background_flush: true,
            save_root: PathBuf::from("Saves"),
            gump_cap: 512,
            hue_picker_cap: 512,
            menu_cap: 512,
            secure_trade_cap: 512,
            coalesce_buffer_size: 512,
            supported_features: 0x92DB,
            character_list_flags: 0x08, // context menus
            servers: vec![GameServerInfo {
                name: "RUO".into(),
                address: Ipv4Addr::new(127, 0, 0, 1),
                port: 2593,
                timezone: 0,
                full_percent: 0,
            }],
        }
    }
}
