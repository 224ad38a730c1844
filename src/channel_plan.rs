//! Uplink/downlink channel tables and the DR↔RPS mapping.
//!
//! `Rps` ("radio parameter set") packs spreading factor, bandwidth, and a
//! downlink-only flag into a byte, mirroring the source's bitfield. The
//! `dr2rps` table is fixed per region at `router_config` time; `rps2dr`
//! does a linear scan back, deliberately *not* excluding DN-only entries —
//! see DESIGN.md for why that open question was resolved this way.

/// Spreading factor / bandwidth / downlink-only, packed as `sf:3, bw:2, dn_only:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rps(u8);

impl Rps {
    pub fn new(sf: u8, bw_index: u8, dn_only: bool) -> Self {
        Rps((sf & 0x7) | ((bw_index & 0x3) << 3) | ((dn_only as u8) << 5))
    }

    pub fn sf(self) -> u8 {
        self.0 & 0x7
    }

    pub fn bw_index(self) -> u8 {
        (self.0 >> 3) & 0x3
    }

    pub fn bw_hz(self) -> u32 {
        match self.bw_index() {
            0 => 125_000,
            1 => 250_000,
            _ => 500_000,
        }
    }

    pub fn dn_only(self) -> bool {
        (self.0 >> 5) & 1 == 1
    }
}

/// One uplink channel: centre frequency, bandwidth, and the SF range it accepts.
#[derive(Debug, Clone, Copy)]
pub struct UpChannel {
    pub freq_hz: u32,
    pub bw_hz: u32,
    pub min_sf: u8,
    pub max_sf: u8,
}

/// One lazily-discovered downlink channel.
#[derive(Debug, Clone, Copy)]
pub struct DnChannel {
    pub freq_hz: u32,
    pub rps: Rps,
}

pub const MAX_UPCHANNELS_PER_CHIP: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct ChannelPlan {
    upchannels: Vec<UpChannel>,
    dnchannels: Vec<Option<DnChannel>>,
    dr2rps: [Option<Rps>; 16],
}

impl ChannelPlan {
    pub fn new(max_dnchannels: usize) -> Self {
        ChannelPlan {
            upchannels: Vec::new(),
            dnchannels: vec![None; max_dnchannels],
            dr2rps: [None; 16],
        }
    }

    pub fn set_upchannels(&mut self, channels: Vec<UpChannel>) {
        self.upchannels = channels;
    }

    pub fn upchannels(&self) -> &[UpChannel] {
        &self.upchannels
    }

    pub fn set_dr(&mut self, dr: u8, rps: Rps) {
        if let Some(slot) = self.dr2rps.get_mut(dr as usize) {
            *slot = Some(rps);
        }
    }

    pub fn dr2rps(&self, dr: u8) -> Option<Rps> {
        self.dr2rps.get(dr as usize).copied().flatten()
    }

    /// Linear scan back from an `Rps` to its DR index. Matches the source's
    /// behaviour of *not* excluding `dn_only` entries from this scan, even
    /// though it is called from uplink-DR resolution.
    pub fn rps2dr(&self, rps: Rps) -> Option<u8> {
        self.dr2rps
            .iter()
            .position(|slot| *slot == Some(rps))
            .map(|i| i as u8)
    }

    /// Looks up a previously-discovered downlink channel at `chnl`, if any.
    pub fn dnchannel(&self, chnl: usize) -> Option<DnChannel> {
        self.dnchannels.get(chnl).copied().flatten()
    }

    /// Registers or looks up a downlink channel for `freq_hz`/`rps`, lazily
    /// allocating the first free slot on first use. Returns the channel
    /// index, or `None` if the table is full and `freq_hz` isn't already present.
    pub fn discover_dnchannel(&mut self, freq_hz: u32, rps: Rps) -> Option<usize> {
        if let Some(idx) = self.dnchannels.iter().position(|c| {
            c.map(|c| c.freq_hz == freq_hz && c.rps == rps).unwrap_or(false)
        }) {
            return Some(idx);
        }
        let idx = self.dnchannels.iter().position(|c| c.is_none())?;
        self.dnchannels[idx] = Some(DnChannel { freq_hz, rps });
        Some(idx)
    }
}
