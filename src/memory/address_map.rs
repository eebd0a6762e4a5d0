use crate::config::{AddrType, SimulationConfig};
use crate::utils::log2;

/// Bit-field layout of a physical HBM address. From the LSB: column bits
/// (one DRAM request), intra-channel column-group bits, channel bits, bank
/// bits, then row bits. Channels and banks must be powers of two so the
/// field extraction can mask.
#[derive(Debug, Clone)]
pub struct AddressMap {
    pub alignment: u32,
    pub channels: u32,
    pub banks_per_ch: u32,
    pub page_size: u32,
    pub channel_mask: AddrType,
    pub channel_offset: u32,
    bank_mask: AddrType,
    bank_offset: u32,
    row_offset: u32,
}

/// 16 column groups sit between the request-sized column bits and the
/// channel bits, interleaving consecutive bursts across channels.
const COLUMN_GROUP_BITS: u32 = 4;

impl AddressMap {
    pub fn new(config: &SimulationConfig) -> Self {
        let channel_offset = log2(config.dram_req_size as u64) + COLUMN_GROUP_BITS;
        let bank_offset = channel_offset + log2(config.dram_channels as u64);
        let row_offset = bank_offset + log2(config.dram_banks_per_ch as u64);
        Self {
            alignment: config.dram_req_size,
            channels: config.dram_channels,
            banks_per_ch: config.dram_banks_per_ch,
            page_size: config.dram_page_size,
            channel_mask: (config.dram_channels - 1) as AddrType,
            channel_offset,
            bank_mask: (config.dram_banks_per_ch - 1) as AddrType,
            bank_offset,
            row_offset,
        }
    }

    /// Round down to the DRAM request granularity.
    pub fn align(&self, addr: AddrType) -> AddrType {
        let alignment = self.alignment as AddrType;
        if addr & (alignment - 1) != 0 {
            addr - (addr & (alignment - 1))
        } else {
            addr
        }
    }

    /// Round up to the DRAM request granularity.
    pub fn align_up(&self, addr: AddrType) -> AddrType {
        let aligned = self.align(addr);
        if aligned == addr {
            addr
        } else {
            aligned + self.alignment as AddrType
        }
    }

    pub fn encode(&self, channel: u32, bank: u32, row: u64, col: u32) -> AddrType {
        assert!((channel as AddrType) <= self.channel_mask, "channel {} out of range", channel);
        assert!((bank as AddrType) <= self.bank_mask, "bank {} out of range", bank);
        (row << self.row_offset)
            | ((bank as AddrType) << self.bank_offset)
            | ((channel as AddrType) << self.channel_offset)
            | col as AddrType
    }

    pub fn decode_channel(&self, addr: AddrType) -> u32 {
        ((addr >> self.channel_offset) & self.channel_mask) as u32
    }

    pub fn decode_bank(&self, addr: AddrType) -> u32 {
        ((addr >> self.bank_offset) & self.bank_mask) as u32
    }

    pub fn decode_row(&self, addr: AddrType) -> u64 {
        addr >> self.row_offset
    }
}

/// Synthetic PIM command addresses. Only the DRAM simulator decodes these;
/// the core treats them as opaque bit-fields riding in `src_addrs`.
///
/// header layout, from the LSB:
///   [0]      is_gwrite
///   [7:1]    num_readres
///   [15:8]   num_comps
///   [31:16]  channel
///   [63:32]  DRAM row
const PIM_GWRITE_BIT: u32 = 0;
const PIM_READRES_SHIFT: u32 = 1;
const PIM_COMPS_SHIFT: u32 = 8;
const PIM_CH_SHIFT: u32 = 16;
const PIM_ROW_SHIFT: u32 = 32;

impl AddressMap {
    pub fn encode_pim_header(
        &self,
        channel: u32,
        row: u64,
        is_gwrite: bool,
        num_comps: u32,
        num_readres: u32,
    ) -> AddrType {
        assert!(num_comps < 1 << (PIM_CH_SHIFT - PIM_COMPS_SHIFT), "num_comps {} out of range", num_comps);
        assert!(num_readres < 1 << (PIM_COMPS_SHIFT - PIM_READRES_SHIFT), "num_readres {} out of range", num_readres);
        (row << PIM_ROW_SHIFT)
            | ((channel as AddrType) << PIM_CH_SHIFT)
            | ((num_comps as AddrType) << PIM_COMPS_SHIFT)
            | ((num_readres as AddrType) << PIM_READRES_SHIFT)
            | ((is_gwrite as AddrType) << PIM_GWRITE_BIT)
    }

    pub fn encode_pim_comps_readres(
        &self,
        channel: u32,
        row: u64,
        num_comps: u32,
        readres: bool,
    ) -> AddrType {
        self.encode_pim_header(channel, row, false, num_comps, readres as u32)
    }

    pub fn decode_pim_channel(&self, addr: AddrType) -> u32 {
        ((addr >> PIM_CH_SHIFT) & 0xffff) as u32
    }

    pub fn decode_pim_row(&self, addr: AddrType) -> u64 {
        addr >> PIM_ROW_SHIFT
    }

    pub fn decode_pim_num_comps(&self, addr: AddrType) -> u32 {
        ((addr >> PIM_COMPS_SHIFT) & 0xff) as u32
    }

    pub fn decode_pim_is_gwrite(&self, addr: AddrType) -> bool {
        addr & 1 == 1
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SimulationConfig;

    fn map() -> AddressMap {
        AddressMap::new(&SimulationConfig::default())
    }

    #[test]
    fn channel_offset_from_request_size() {
        // 64B requests -> 6 column bits, plus 4 column-group bits
        assert_eq!(map().channel_offset, 10);
        assert_eq!(map().channel_mask, 31);
    }

    #[test]
    fn channel_roundtrip() {
        let m = map();
        for ch in 0..m.channels {
            let addr = m.encode(ch, 3, 77, 21);
            assert_eq!(m.decode_channel(addr), ch);
            assert_eq!(m.decode_bank(addr), 3);
            assert_eq!(m.decode_row(addr), 77);
        }
    }

    #[test]
    fn alignment_rounds() {
        let m = map();
        assert_eq!(m.align(100), 64);
        assert_eq!(m.align(64), 64);
        assert_eq!(m.align_up(65), 128);
        assert_eq!(m.align_up(128), 128);
    }

    #[test]
    fn pim_header_fields_roundtrip() {
        let m = map();
        let header = m.encode_pim_header(7, 12345, false, 32, 1);
        assert_eq!(m.decode_pim_channel(header), 7);
        assert_eq!(m.decode_pim_row(header), 12345);
        assert_eq!(m.decode_pim_num_comps(header), 32);
        assert!(!m.decode_pim_is_gwrite(header));

        let gwrite = m.encode_pim_header(0, 0, true, 0, 0);
        assert!(m.decode_pim_is_gwrite(gwrite));
    }
}
