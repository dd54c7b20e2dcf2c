//! Byte size formatting

const KIB: i64 = 1 << 10;
const MIB: i64 = 1 << 20;
const GIB: i64 = 1 << 30;
const TIB: i64 = 1 << 40;

/// Binary unit a byte count is displayed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteUnit {
    B,
    KiB,
    MiB,
    GiB,
    TiB,
}

impl ByteUnit {
    fn divisor(self) -> i64 {
        match self {
            ByteUnit::B => 1,
            ByteUnit::KiB => KIB,
            ByteUnit::MiB => MIB,
            ByteUnit::GiB => GIB,
            ByteUnit::TiB => TIB,
        }
    }

    /// Largest unit that keeps the value at or above one
    pub fn for_bytes(bytes: i64) -> Self {
        match bytes.unsigned_abs() {
            b if b >= TIB as u64 => ByteUnit::TiB,
            b if b >= GIB as u64 => ByteUnit::GiB,
            b if b >= MIB as u64 => ByteUnit::MiB,
            b if b >= KIB as u64 => ByteUnit::KiB,
            _ => ByteUnit::B,
        }
    }
}

impl std::fmt::Display for ByteUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ByteUnit::B => "B",
            ByteUnit::KiB => "KiB",
            ByteUnit::MiB => "MiB",
            ByteUnit::GiB => "GiB",
            ByteUnit::TiB => "TiB",
        };
        f.write_str(name)
    }
}

/// Convert a byte count into its natural unit
pub fn convert_bytes(bytes: i64) -> (f64, ByteUnit) {
    let unit = ByteUnit::for_bytes(bytes);
    (convert_bytes_to_unit(bytes, unit), unit)
}

/// Convert a byte count into a given unit
pub fn convert_bytes_to_unit(bytes: i64, unit: ByteUnit) -> f64 {
    bytes as f64 / unit.divisor() as f64
}

/// Size change between two byte counts as magnitude, sign and unit
pub fn diff_bytes(before: i64, after: i64) -> (f64, bool, ByteUnit) {
    let delta = after - before;
    let (value, unit) = convert_bytes(delta.abs());
    (value, delta < 0, unit)
}
