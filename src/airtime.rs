//! Time-on-air calculation for LoRa and FSK physical layers.
//!
//! The LoRa formula is the one from Semtech's AN1200.13: preamble symbols
//! plus a payload symbol count that depends on spreading factor, bandwidth,
//! coding rate, and whether low-data-rate optimization is active. All of
//! it is done in integer microseconds — every bandwidth this core supports
//! divides `(1 << sf) * 1_000_000` evenly, so there is no rounding to
//! reason about.

/// Modulation and framing parameters needed to size a transmission.
#[derive(Debug, Clone, Copy)]
pub enum Modulation {
    Lora {
        sf: u8,
        bw_hz: u32,
        coding_rate: u8,
        /// Low data rate optimization; forced on for SF11/SF12 @ 125kHz
        /// by [`airtime_us`] regardless of this flag.
        low_rate_opt: bool,
    },
    Fsk {
        bitrate_bps: u32,
    },
}

/// Explicit header is the only mode this core emits; `preamble` is in
/// symbols (LoRa) and bytes (FSK).
#[derive(Debug, Clone, Copy)]
pub struct FrameParams {
    pub payload_len: u16,
    pub preamble: u16,
    pub crc: bool,
}

/// Time-on-air in microseconds for `payload_len` bytes under `modulation`.
pub fn airtime_us(modulation: Modulation, frame: FrameParams) -> u32 {
    match modulation {
        Modulation::Lora { sf, bw_hz, coding_rate, low_rate_opt } => {
            lora_airtime_us(sf, bw_hz, coding_rate, low_rate_opt, frame)
        }
        Modulation::Fsk { bitrate_bps } => fsk_airtime_us(bitrate_bps, frame),
    }
}

fn lora_airtime_us(sf: u8, bw_hz: u32, coding_rate: u8, low_rate_opt: bool, frame: FrameParams) -> u32 {
    let de = low_rate_opt || (sf >= 11 && bw_hz == 125_000);
    let tsym_us = ((1u64 << sf) * 1_000_000) / bw_hz as u64;

    // Preamble + 4.25 symbols of sync, in quarter-symbol units to stay exact.
    let preamble_us = (frame.preamble as u64 * 4 + 17) * tsym_us / 4;

    let sf_i = sf as i64;
    let de_bit = if de { 2 } else { 0 };
    let numerator = 8 * frame.payload_len as i64 - 4 * sf_i + 28 + if frame.crc { 16 } else { 0 };
    let denom = 4 * (sf_i - de_bit);
    let n_payload_symb = if numerator > 0 {
        div_ceil_i64(numerator, denom) * (coding_rate as i64 + 4)
    } else {
        0
    };
    let payload_symb_nb = 8 + n_payload_symb.max(0);

    (preamble_us + payload_symb_nb as u64 * tsym_us) as u32
}

fn div_ceil_i64(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

/// Preamble + 3 bytes sync word + 1 length byte + payload + 2 byte CRC,
/// each byte costing 8 bits at `bitrate_bps`.
fn fsk_airtime_us(bitrate_bps: u32, frame: FrameParams) -> u32 {
    let preamble_bytes = frame.preamble as u64;
    let sync_bytes = 3;
    let len_byte = 1;
    let crc_bytes = if frame.crc { 2 } else { 0 };
    let total_bytes = preamble_bytes + sync_bytes + len_byte + frame.payload_len as u64 + crc_bytes;
    ((total_bytes * 8 * 1_000_000) / bitrate_bps as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sf7_bw125_20b_matches_known_answer() {
        let t = airtime_us(
            Modulation::Lora { sf: 7, bw_hz: 125_000, coding_rate: 1, low_rate_opt: false },
            FrameParams { payload_len: 20, preamble: 8, crc: true },
        );
        assert!((t as i64 - 56_576).abs() <= 1, "got {t}");
    }

    #[test]
    fn sf12_bw125_forces_low_rate_optimization() {
        let t = airtime_us(
            Modulation::Lora { sf: 12, bw_hz: 125_000, coding_rate: 1, low_rate_opt: false },
            FrameParams { payload_len: 20, preamble: 8, crc: true },
        );
        // SF12 is far slower per symbol and DE kicks in automatically;
        // this is a monotonicity/sanity check, not a literature value.
        assert!(t > 900_000, "got {t}");
    }

    #[test]
    fn higher_spreading_factor_is_always_slower() {
        let frame = FrameParams { payload_len: 20, preamble: 8, crc: true };
        let mut last = 0u32;
        for sf in 7..=12u8 {
            let t = airtime_us(Modulation::Lora { sf, bw_hz: 125_000, coding_rate: 1, low_rate_opt: false }, frame);
            assert!(t > last, "sf={sf} airtime {t} should exceed previous {last}");
            last = t;
        }
    }

    #[test]
    fn wider_bandwidth_is_always_faster() {
        let frame = FrameParams { payload_len: 20, preamble: 8, crc: true };
        let t125 = airtime_us(Modulation::Lora { sf: 9, bw_hz: 125_000, coding_rate: 1, low_rate_opt: false }, frame);
        let t500 = airtime_us(Modulation::Lora { sf: 9, bw_hz: 500_000, coding_rate: 1, low_rate_opt: false }, frame);
        assert!(t500 < t125);
    }

    #[test]
    fn fsk_scales_linearly_with_payload() {
        let base = FrameParams { payload_len: 20, preamble: 5, crc: true };
        let doubled = FrameParams { payload_len: 40, preamble: 5, crc: true };
        let t1 = airtime_us(Modulation::Fsk { bitrate_bps: 50_000 }, base);
        let t2 = airtime_us(Modulation::Fsk { bitrate_bps: 50_000 }, doubled);
        assert!(t2 > t1);
    }
}
