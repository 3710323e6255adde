use serde::Serialize;

use super::config::DramConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DramCoord {
    pub channel: usize,
    pub rank: usize,
    pub bank: usize,
    pub row: u64,
    pub column: u64,
}

#[derive(Debug, Clone, Copy)]
struct Field {
    shift: u32,
    mask: u64,
}

impl Field {
    fn new(shift: u32, count: u64) -> Self {
        Self {
            shift,
            mask: count - 1,
        }
    }

    fn bits(&self) -> u32 {
        self.mask.count_ones()
    }

    fn extract(&self, addr: u64) -> u64 {
        (addr >> self.shift) & self.mask
    }

    fn place(&self, value: u64) -> u64 {
        (value & self.mask) << self.shift
    }
}

/// Physical address layout, low bits first: offset | column | channel | bank | rank | row.
/// Consecutive accesses walk a row's columns before moving to the next channel.
#[derive(Debug, Clone, Copy)]
pub struct AddressMapping {
    offset_bits: u32,
    column: Field,
    channel: Field,
    bank: Field,
    rank: Field,
    row: Field,
}

impl AddressMapping {
    pub fn new(config: &DramConfig) -> Self {
        let offset_bits = config.access_bytes().trailing_zeros();
        let column = Field::new(offset_bits, config.columns());
        let channel = Field::new(column.shift + column.bits(), config.channels as u64);
        let bank = Field::new(channel.shift + channel.bits(), config.banks as u64);
        let rank = Field::new(bank.shift + bank.bits(), config.ranks as u64);
        let row = Field::new(rank.shift + rank.bits(), config.rows());
        Self {
            offset_bits,
            column,
            channel,
            bank,
            rank,
            row,
        }
    }

    pub fn access_bytes(&self) -> u64 {
        1 << self.offset_bits
    }

    pub fn decode(&self, addr: u64) -> DramCoord {
        DramCoord {
            channel: self.channel.extract(addr) as usize,
            rank: self.rank.extract(addr) as usize,
            bank: self.bank.extract(addr) as usize,
            row: self.row.extract(addr),
            column: self.column.extract(addr),
        }
    }

    /// Address of the first byte of `coord`.
    pub fn encode(&self, coord: &DramCoord) -> u64 {
        self.column.place(coord.column)
            | self.channel.place(coord.channel as u64)
            | self.bank.place(coord.bank as u64)
            | self.rank.place(coord.rank as u64)
            | self.row.place(coord.row)
    }

    pub fn channel_of(&self, addr: u64) -> usize {
        self.channel.extract(addr) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout() {
        let mapping = AddressMapping::new(&DramConfig::default());
        // 64B access, 32 columns, 2 channels, 8 banks, 1 rank
        assert_eq!(64, mapping.access_bytes());
        let c = mapping.decode(0x40);
        assert_eq!((0, 1, 0), (c.channel, c.column, c.bank));
        let c = mapping.decode(0x800);
        assert_eq!((1, 0), (c.channel, c.column));
        let c = mapping.decode(0x1000);
        assert_eq!((0, 1, 0), (c.channel, c.bank, c.row));
        let c = mapping.decode(0x8000);
        assert_eq!((0, 0, 1), (c.channel, c.bank, c.row));
    }

    #[test]
    fn encode_inverts_decode() {
        let mapping = AddressMapping::new(&DramConfig::default());
        for addr in [0u64, 0x40, 0x12_3440, 0x3fff_ffc0] {
            assert_eq!(addr, mapping.encode(&mapping.decode(addr)));
        }
    }
}
