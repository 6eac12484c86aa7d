use plain::Plain;

pub const MAX_REGION_NAME_LEN: usize = 500;
pub const MAX_FILE_NAME_LEN: usize = 256;
pub const MAX_COUNTER_NAME_LEN: usize = 256;
pub const MAX_COUNTER_UNIT_LEN: usize = 10;

pub const ADAPTER_USER: u32 = 1;
pub const ADAPTER_COMPILER: u32 = 2;
pub const ADAPTER_MPI: u32 = 5;
pub const ADAPTER_POMP: u32 = 7;

/// The five binary buffers a monitored process streams back after
/// `getsummarydata;`, in arrival order. Each is announced by an uppercase
/// header line followed by a native-endian u32 element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    RegionDefinitions,
    FlatProfile,
    CounterDefinitions,
    CallTreeDefinitions,
    RtsMeasurements,
}

impl BufferKind {
    pub fn header(&self) -> &'static str {
        match self {
            BufferKind::RegionDefinitions => "MERGED_REGION_DEFINITIONS",
            BufferKind::FlatProfile => "FLAT_PROFILE",
            // The runtime announces counter definitions under the metric name.
            BufferKind::CounterDefinitions => "METRIC_DEFINITIONS",
            BufferKind::CallTreeDefinitions => "CALLTREE_DEFINITIONS",
            BufferKind::RtsMeasurements => "RTS_MEASUREMENTS",
        }
    }

    pub fn record_size(&self) -> usize {
        match self {
            BufferKind::RegionDefinitions => std::mem::size_of::<RegionDefRecord>(),
            BufferKind::FlatProfile => std::mem::size_of::<FlatProfileRecord>(),
            BufferKind::CounterDefinitions => std::mem::size_of::<CounterDefRecord>(),
            BufferKind::CallTreeDefinitions => std::mem::size_of::<CallTreeDefRecord>(),
            BufferKind::RtsMeasurements => std::mem::size_of::<RtsMeasurementRecord>(),
        }
    }
}

/// Merged source-code region definition. 772 bytes on the wire.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RegionDefRecord {
    pub region_id: u32,
    pub name: [u8; MAX_REGION_NAME_LEN],
    pub file: [u8; MAX_FILE_NAME_LEN],
    pub rfl: u32,
    pub rel: u32,
    pub adapter_type: u32,
}

unsafe impl Plain for RegionDefRecord {}

impl Default for RegionDefRecord {
    fn default() -> Self {
        RegionDefRecord {
            region_id: 0,
            name: [0; MAX_REGION_NAME_LEN],
            file: [0; MAX_FILE_NAME_LEN],
            rfl: 0,
            rel: 0,
            adapter_type: 0,
        }
    }
}

/// One flat-profile sample. 48 bytes on the wire, u64-aligned.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct FlatProfileRecord {
    pub measurement_id: u32,
    pub rank: u64,
    pub thread: u32,
    pub region_id: u32,
    pub samples: u64,
    pub metric_id: u32,
    pub int_val: u64,
}

unsafe impl Plain for FlatProfileRecord {}

/// Counter definition announcing a wire metric name and its slot id.
/// The slot id is the record's position in the buffer. 272 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CounterDefRecord {
    pub name: [u8; MAX_COUNTER_NAME_LEN],
    pub unit: [u8; MAX_COUNTER_UNIT_LEN],
    pub status: u32,
}

unsafe impl Plain for CounterDefRecord {}

impl Default for CounterDefRecord {
    fn default() -> Self {
        CounterDefRecord {
            name: [0; MAX_COUNTER_NAME_LEN],
            unit: [0; MAX_COUNTER_UNIT_LEN],
            status: 0,
        }
    }
}

/// Call-tree node definition. Links carry per-cycle native ids; names
/// resolve against the region registry. 512 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CallTreeDefRecord {
    pub region_id: u32,
    pub name: [u8; MAX_REGION_NAME_LEN],
    pub node_id: u32,
    pub parent_node_id: u32,
}

unsafe impl Plain for CallTreeDefRecord {}

impl Default for CallTreeDefRecord {
    fn default() -> Self {
        CallTreeDefRecord {
            region_id: 0,
            name: [0; MAX_REGION_NAME_LEN],
            node_id: 0,
            parent_node_id: 0,
        }
    }
}

/// One per-node measurement sample, addressed by a per-cycle native node
/// id. 48 bytes on the wire.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct RtsMeasurementRecord {
    pub rank: u64,
    pub thread: u32,
    pub count: u64,
    pub metric_id: u32,
    pub int_val: u64,
    pub node_id: u32,
}

unsafe impl Plain for RtsMeasurementRecord {}

/// Decodes a received buffer into fixed-layout records. The buffer length
/// is validated against the element count before this is called, so a
/// short chunk cannot occur.
pub fn decode_records<T: Plain + Copy + Default>(data: &[u8]) -> Vec<T> {
    data.chunks_exact(std::mem::size_of::<T>())
        .map(|chunk| {
            let mut record = T::default();
            plain::copy_from_bytes(&mut record, chunk).expect("Data buffer was too short");
            record
        })
        .collect()
}

/// Reads a NUL-terminated fixed-width field as a string.
pub fn fixed_cstr(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Writes a string into a fixed-width NUL-padded field, truncating.
pub fn write_cstr(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(field.len().saturating_sub(1));
    field[..len].copy_from_slice(&bytes[..len]);
    for b in field[len..].iter_mut() {
        *b = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_wire_layout() {
        assert_eq!(std::mem::size_of::<RegionDefRecord>(), 772);
        assert_eq!(std::mem::size_of::<FlatProfileRecord>(), 48);
        assert_eq!(std::mem::size_of::<CounterDefRecord>(), 272);
        assert_eq!(std::mem::size_of::<CallTreeDefRecord>(), 512);
        assert_eq!(std::mem::size_of::<RtsMeasurementRecord>(), 48);
    }

    #[test]
    fn decode_reads_back_encoded_records() {
        let mut record = RegionDefRecord {
            region_id: 42,
            rfl: 10,
            rel: 20,
            adapter_type: ADAPTER_USER,
            ..Default::default()
        };
        write_cstr(&mut record.name, "mainRegion");
        write_cstr(&mut record.file, "main.c");

        let bytes = unsafe { plain::as_bytes(&record) }.to_vec();
        let decoded: Vec<RegionDefRecord> = decode_records(&bytes);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].region_id, 42);
        assert_eq!(fixed_cstr(&decoded[0].name), "mainRegion");
        assert_eq!(fixed_cstr(&decoded[0].file), "main.c");
    }

    #[test]
    fn fixed_cstr_handles_unterminated_fields() {
        let field = [b'a'; 8];
        assert_eq!(fixed_cstr(&field), "aaaaaaaa");
    }

    #[test]
    fn write_cstr_truncates_and_terminates() {
        let mut field = [0xffu8; 6];
        write_cstr(&mut field, "abcdefgh");
        assert_eq!(fixed_cstr(&field), "abcde");
        assert_eq!(field[5], 0);
    }
}
