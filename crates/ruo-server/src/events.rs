// events.rs — the seam between the engine and the game layer
//
// The engine never implements game rules; it surfaces decisions through
// this callbacks trait and acts on the answers. Defaults are permissive
// no-ops so a bare engine still runs (and tests can override one method at
// a time).

use std::net::SocketAddr;

use ruo_common::serial::Serial;

use crate::entity::Point3D;
use crate::world::World;

/// Rejection codes for the account-login reject packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginRejection {
    Invalid = 0x00,
    InUse = 0x01,
    Blocked = 0x02,
    BadPassword = 0x03,
    Idle = 0xFE,
    BadCommunication = 0xFF,
}

#[derive(Debug, Clone, Default)]
pub struct CharacterEntry {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct CityInfo {
    pub index: u8,
    pub city: String,
    pub building: String,
}

/// Everything the game layer hands back on a successful game login.
#[derive(Debug, Clone, Default)]
pub struct GameLoginResult {
    pub characters: Vec<CharacterEntry>,
    pub cities: Vec<CityInfo>,
}

#[derive(Debug, Clone)]
pub struct CharacterCreateArgs {
    pub name: String,
    pub female: bool,
    pub body: u16,
    pub hue: u16,
    pub city_index: u8,
}

/// What the client clicked in response to a targeting cursor.
#[derive(Debug, Clone, Copy)]
pub struct TargetResult {
    pub target_id: u32,
    pub targeted: Serial,
    pub location: Point3D,
    pub graphic: u16,
}

#[derive(Debug, Clone)]
pub struct GumpResponse {
    pub serial: Serial,
    pub type_id: u32,
    pub button_id: u32,
    pub switches: Vec<u32>,
    pub text_entries: Vec<(u16, String)>,
}

#[derive(Debug, Clone, Copy)]
pub struct BuyItemRequest {
    pub serial: Serial,
    pub amount: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechKind {
    Regular,
    Whisper,
    Yell,
    Emote,
}

pub trait GameEvents: Send {
    /// Admission hook; false closes the socket before a NetState exists.
    fn socket_connect(&mut self, _addr: SocketAddr) -> bool {
        true
    }

    fn account_login(&mut self, _username: &str, _password: &str) -> Result<(), LoginRejection> {
        Ok(())
    }

    fn game_login(&mut self, _username: &str, _password: &str) -> Result<GameLoginResult, LoginRejection> {
        Ok(GameLoginResult::default())
    }

    /// Returns the mobile to attach, or None to reject the creation.
    fn create_character(
        &mut self,
        _world: &mut World,
        _args: &CharacterCreateArgs,
    ) -> Option<Serial> {
        None
    }

    /// Returns the mobile to attach for a character-play request.
    fn play_character(
        &mut self,
        _world: &mut World,
        _username: &str,
        _slot: u32,
    ) -> Option<Serial> {
        None
    }

    /// True removes the character slot.
    fn delete_character(&mut self, _world: &mut World, _username: &str, _slot: u32) -> bool {
        false
    }

    /// Fired once per connection when the login timer completes.
    fn login(&mut self, _world: &mut World, _mobile: Serial) {}

    /// True allows the step; the engine acks or rejects accordingly.
    fn movement(&mut self, _world: &mut World, _mobile: Serial, _direction: u8) -> bool {
        true
    }

    fn speech(
        &mut self,
        _world: &mut World,
        _mobile: Serial,
        _kind: SpeechKind,
        _hue: u16,
        _text: &str,
        _keywords: &[u16],
    ) {
    }

    fn target_response(&mut self, _world: &mut World, _mobile: Serial, _target: Option<TargetResult>) {}

    fn gump_response(&mut self, _world: &mut World, _mobile: Serial, _response: &GumpResponse) {}

    /// True accepts the purchase list.
    fn vendor_buy(
        &mut self,
        _world: &mut World,
        _buyer: Serial,
        _vendor: Serial,
        _items: &[BuyItemRequest],
    ) -> bool {
        true
    }

    fn disconnected(&mut self, _world: &mut World, _mobile: Serial) {}

    fn world_load(&mut self, _world: &mut World) {}

    fn world_save(&mut self, _world: &mut World) {}
}

/// The bare engine: every decision takes the permissive default.
pub struct NullEvents;

impl GameEvents for NullEvents {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_events_defaults() {
        let mut ev = NullEvents;
        assert!(ev.socket_connect("127.0.0.1:1".parse().unwrap()));
        assert!(ev.account_login("user", "pass").is_ok());
        assert!(ev.game_login("user", "pass").unwrap().characters.is_empty());
    }
}
