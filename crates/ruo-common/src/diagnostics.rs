// diagnostics.rs — per-opcode and named timing counters
//
// Cheap enough to stay on in production: each sample is a counter bump and
// two duration adds against a monotonic clock. Dumps are sorted by total
// time so the expensive rows surface first.

use std::collections::HashMap;
use std::io::{self, Write};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
pub struct Profile {
    pub count: u64,
    pub total: Duration,
    pub peak: Duration,
}

impl Profile {
    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        if elapsed > self.peak {
            self.peak = elapsed;
        }
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

/// A profile that also tracks cumulative wire bytes, for packet tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketProfile {
    pub profile: Profile,
    pub bytes: u64,
}

impl PacketProfile {
    pub fn record(&mut self, elapsed: Duration, length: usize) {
        self.profile.record(elapsed);
        self.bytes += length as u64;
    }
}

pub struct Diagnostics {
    sent: Box<[PacketProfile; 256]>,
    received: Box<[PacketProfile; 256]>,
    timers: HashMap<&'static str, Profile>,
}

impl Diagnostics {
    pub fn new() -> Diagnostics {
        Diagnostics {
            sent: Box::new([PacketProfile::default(); 256]),
            received: Box::new([PacketProfile::default(); 256]),
            timers: HashMap::new(),
        }
    }

    pub fn record_sent(&mut self, opcode: u8, elapsed: Duration, length: usize) {
        self.sent[opcode as usize].record(elapsed, length);
    }

    pub fn record_received(&mut self, opcode: u8, elapsed: Duration, length: usize) {
        self.received[opcode as usize].record(elapsed, length);
    }

    pub fn record_timer(&mut self, name: &'static str, elapsed: Duration) {
        self.timers.entry(name).or_default().record(elapsed);
    }

    pub fn sent(&self, opcode: u8) -> &PacketProfile {
        &self.sent[opcode as usize]
    }

    pub fn received(&self, opcode: u8) -> &PacketProfile {
        &self.received[opcode as usize]
    }

    /// Dump every non-empty table, each sorted by total time descending.
    pub fn write_all(&self, sink: &mut dyn Write) -> io::Result<()> {
        Self::write_packet_table(sink, "Sent packets", &*self.sent)?;
        Self::write_packet_table(sink, "Received packets", &*self.received)?;

        if !self.timers.is_empty() {
            writeln!(sink, "-- Timers --")?;
            let mut rows: Vec<_> = self.timers.iter().collect();
            rows.sort_by(|a, b| b.1.total.cmp(&a.1.total));

            for (name, profile) in rows {
                writeln!(
                    sink,
                    "{:<32} count={:<10} total={:?} peak={:?} avg={:?}",
                    name,
                    profile.count,
                    profile.total,
                    profile.peak,
                    profile.average()
                )?;
            }
        }

        Ok(())
    }

    fn write_packet_table(
        sink: &mut dyn Write,
        title: &str,
        table: &[PacketProfile; 256],
    ) -> io::Result<()> {
        let mut rows: Vec<(usize, &PacketProfile)> = table
            .iter()
            .enumerate()
            .filter(|(_, p)| p.profile.count > 0)
            .collect();

        if rows.is_empty() {
            return Ok(());
        }

        rows.sort_by(|a, b| b.1.profile.total.cmp(&a.1.profile.total));

        writeln!(sink, "-- {} --", title)?;
        for (opcode, p) in rows {
            writeln!(
                sink,
                "0x{:02X} count={:<10} bytes={:<12} total={:?} peak={:?} avg={:?}",
                opcode,
                p.profile.count,
                p.bytes,
                p.profile.total,
                p.profile.peak,
                p.profile.average()
            )?;
        }

        Ok(())
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_peak_and_average() {
        let mut p = Profile::default();
        p.record(Duration::from_millis(2));
        p.record(Duration::from_millis(6));
        assert_eq!(p.count, 2);
        assert_eq!(p.peak, Duration::from_millis(6));
        assert_eq!(p.average(), Duration::from_millis(4));
    }

    #[test]
    fn test_dump_sorts_by_total() {
        let mut d = Diagnostics::new();
        d.record_sent(0x22, Duration::from_millis(1), 3);
        d.record_sent(0xA9, Duration::from_millis(9), 300);
        d.record_timer("save", Duration::from_secs(1));

        let mut out = Vec::new();
        d.write_all(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        let pos_a9 = text.find("0xA9").unwrap();
        let pos_22 = text.find("0x22").unwrap();
        assert!(pos_a9 < pos_22);
        assert!(text.contains("save"));
    }
}
