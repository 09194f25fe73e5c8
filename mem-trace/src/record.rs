use std::fmt;
use std::str::FromStr;

/// Effective address stored for instructions that have no memory operand.
///
/// Records carrying this address are kept in the buffer for instruction-count context but are
/// never written to the trace.
pub const SENTINEL_ADDRESS: u64 = 0;

/// Line appended as the very last line of every trace.
pub const EOF_MARKER: &str = "#eof";

/// Host-assigned thread identifier, unique among live threads.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u32);

impl ThreadId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ThreadId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Direction of a memory access.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum Access {
    #[default]
    Write = 0,
    Read = 1,
}

impl Access {
    pub fn is_read(self) -> bool {
        matches!(self, Self::Read)
    }

    fn flag(self) -> u8 {
        self as u8
    }
}

/// One observed memory access.
///
/// # Format
///
/// `<pc> <effective address> <size> <thread id> <read>`
///
/// All fields are decimal and `<read>` is `1` for reads and `0` for writes.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct MemoryAccessRecord {
    pc: u64,
    address: u64,
    size: u32,
    thread: ThreadId,
    access: Access,
}

impl MemoryAccessRecord {
    pub const fn new(pc: u64, address: u64, size: u32, thread: ThreadId, access: Access) -> Self {
        Self {
            pc,
            address,
            size,
            thread,
            access,
        }
    }

    /// Constructs a record for a load of `size` bytes from `address`.
    pub const fn read(pc: u64, address: u64, size: u32, thread: ThreadId) -> Self {
        Self::new(pc, address, size, thread, Access::Read)
    }

    /// Constructs a record for a store of `size` bytes to `address`.
    pub const fn write(pc: u64, address: u64, size: u32, thread: ThreadId) -> Self {
        Self::new(pc, address, size, thread, Access::Write)
    }

    /// Constructs a record for an instruction without a memory operand.
    pub const fn bare(pc: u64, thread: ThreadId) -> Self {
        Self::new(pc, SENTINEL_ADDRESS, 0, thread, Access::Write)
    }

    /// Returns the address of the instruction that performed the access.
    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// Returns the effective address of the memory operand.
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn is_read(&self) -> bool {
        self.access.is_read()
    }

    /// Returns `true` if this record does not describe a memory access and must be omitted from
    /// the trace.
    pub fn is_sentinel(&self) -> bool {
        self.address == SENTINEL_ADDRESS
    }
}

impl fmt::Display for MemoryAccessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.pc,
            self.address,
            self.size,
            self.thread,
            self.access.flag()
        )
    }
}

/// A single line of a memory trace.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TraceLine {
    /// `thread begin <id>`
    ThreadBegin(ThreadId),
    /// `thread end <id> code <exit code>`
    ThreadEnd { thread: ThreadId, code: i32 },
    /// `thread <id> entered ROI`
    RoiEnter(ThreadId),
    /// `thread <id> exited ROI`
    RoiExit(ThreadId),
    /// `<pc> <ea> <size> <tid> <read>`
    Access(MemoryAccessRecord),
    /// `#eof`
    Eof,
}

impl fmt::Display for TraceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThreadBegin(thread) => write!(f, "thread begin {thread}"),
            Self::ThreadEnd { thread, code } => write!(f, "thread end {thread} code {code}"),
            Self::RoiEnter(thread) => write!(f, "thread {thread} entered ROI"),
            Self::RoiExit(thread) => write!(f, "thread {thread} exited ROI"),
            Self::Access(record) => record.fmt(f),
            Self::Eof => f.write_str(EOF_MARKER),
        }
    }
}

impl From<MemoryAccessRecord> for TraceLine {
    fn from(record: MemoryAccessRecord) -> Self {
        Self::Access(record)
    }
}

impl FromStr for TraceLine {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end();
        if line == EOF_MARKER {
            return Ok(Self::Eof);
        }

        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        match fields.as_slice() {
            [] => Err(ParseError::Empty),
            ["thread", "begin", id] => Ok(Self::ThreadBegin(parse_thread(id)?)),
            ["thread", "end", id, "code", code] => Ok(Self::ThreadEnd {
                thread: parse_thread(id)?,
                code: parse_field("code", code)?,
            }),
            ["thread", id, "entered", "ROI"] => Ok(Self::RoiEnter(parse_thread(id)?)),
            ["thread", id, "exited", "ROI"] => Ok(Self::RoiExit(parse_thread(id)?)),
            [pc, address, size, thread, read] => {
                let access = match *read {
                    "1" => Access::Read,
                    "0" => Access::Write,
                    other => {
                        return Err(ParseError::BadField {
                            field: "read",
                            value: String::from(other),
                        })
                    }
                };
                Ok(Self::Access(MemoryAccessRecord::new(
                    parse_field("pc", pc)?,
                    parse_field("address", address)?,
                    parse_field("size", size)?,
                    parse_thread(thread)?,
                    access,
                )))
            }
            _ => Err(ParseError::UnknownLine(String::from(line))),
        }
    }
}

fn parse_thread(value: &str) -> Result<ThreadId, ParseError> {
    parse_field("thread", value).map(ThreadId)
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::BadField {
        field,
        value: String::from(value),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("trace line is empty")]
    Empty,

    #[error("unrecognized trace line: {0:?}")]
    UnknownLine(String),

    #[error("invalid {field} field: {value:?}")]
    BadField { field: &'static str, value: String },
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_access_line_field_order() {
        let record = MemoryAccessRecord::read(0x401000, 0x7ffc0010, 8, ThreadId::new(2));
        assert_eq!(record.to_string(), "4198400 2147221520 8 2 1");

        let record = MemoryAccessRecord::write(16, 32, 4, ThreadId::new(0));
        assert_eq!(record.to_string(), "16 32 4 0 0");
    }

    #[test]
    fn test_bare_record_is_sentinel() {
        let record = MemoryAccessRecord::bare(0x1000, ThreadId::new(1));
        assert!(record.is_sentinel());
        assert_eq!(record.size(), 0);
        assert!(!MemoryAccessRecord::read(0x1000, 0x2000, 1, ThreadId::new(1)).is_sentinel());
    }

    #[test]
    fn test_event_lines() {
        let tid = ThreadId::new(3);
        assert_eq!(TraceLine::ThreadBegin(tid).to_string(), "thread begin 3");
        assert_eq!(
            TraceLine::ThreadEnd { thread: tid, code: -1 }.to_string(),
            "thread end 3 code -1"
        );
        assert_eq!(TraceLine::RoiEnter(tid).to_string(), "thread 3 entered ROI");
        assert_eq!(TraceLine::RoiExit(tid).to_string(), "thread 3 exited ROI");
        assert_eq!(TraceLine::Eof.to_string(), "#eof");
    }

    #[test]
    fn test_parse_lines() {
        assert_eq!("#eof".parse::<TraceLine>(), Ok(TraceLine::Eof));
        assert_eq!(
            "thread end 7 code 0\n".parse::<TraceLine>(),
            Ok(TraceLine::ThreadEnd {
                thread: ThreadId::new(7),
                code: 0
            })
        );
        assert_eq!(
            "100 200 4 1 0".parse::<TraceLine>(),
            Ok(TraceLine::Access(MemoryAccessRecord::write(
                100,
                200,
                4,
                ThreadId::new(1)
            )))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!("".parse::<TraceLine>(), Err(ParseError::Empty));
        assert!(matches!(
            "100 200 4 1 2".parse::<TraceLine>(),
            Err(ParseError::BadField { field: "read", .. })
        ));
        assert!(matches!(
            "thread begin x".parse::<TraceLine>(),
            Err(ParseError::BadField {
                field: "thread",
                ..
            })
        ));
        assert!(matches!(
            "dumping buffer to file".parse::<TraceLine>(),
            Err(ParseError::UnknownLine(_))
        ));
    }
}
