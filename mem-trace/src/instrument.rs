//! Decides which capture probes to install for an instruction.
//!
//! The host describes each instruction once, when it is first translated. The plan returned here
//! lists the probes to run before every execution of that instruction and the field values each
//! probe stores; only the effective address is left for the host to supply at run time.

use std::fmt;
use std::str::FromStr;

use crate::record::{Access, MemoryAccessRecord, ThreadId};

/// Which instructions produce records.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum RecordMode {
    /// Only instructions with a memory operand.
    #[default]
    MemoryOnly,
    /// Every instruction; those without a memory operand store a sentinel record.
    AllInstructions,
}

impl fmt::Display for RecordMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryOnly => f.write_str("memory"),
            Self::AllInstructions => f.write_str("all"),
        }
    }
}

impl FromStr for RecordMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::MemoryOnly),
            "all" => Ok(Self::AllInstructions),
            other => Err(format!("expected 'memory' or 'all', got {other:?}")),
        }
    }
}

/// What the host knows about an instruction at translation time.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct InstructionInfo {
    pub pc: u64,
    /// Size of the memory read operand, if the instruction reads memory.
    pub read_size: Option<u32>,
    /// Whether the instruction has a second, independent memory read operand.
    pub has_second_read: bool,
    /// Size of the memory write operand, if the instruction writes memory.
    pub write_size: Option<u32>,
}

impl InstructionInfo {
    pub fn has_memory_operand(&self) -> bool {
        self.read_size.is_some() || self.write_size.is_some()
    }
}

/// The operand whose effective address a probe captures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    Read,
    SecondRead,
    Write,
    /// No memory operand; the sentinel address is stored.
    None,
}

/// A capture point to run before the instruction executes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Probe {
    pub pc: u64,
    pub operand: Operand,
    pub size: u32,
    pub access: Access,
}

impl Probe {
    /// Builds the record this probe stores for one execution.
    ///
    /// `address` is ignored for [`Operand::None`] probes.
    #[inline]
    pub fn record(&self, address: u64, thread: ThreadId) -> MemoryAccessRecord {
        match self.operand {
            Operand::None => MemoryAccessRecord::bare(self.pc, thread),
            _ => MemoryAccessRecord::new(self.pc, address, self.size, thread, self.access),
        }
    }
}

/// Returns the probes to install for `info`, in execution order.
pub fn plan(info: &InstructionInfo, mode: RecordMode) -> Vec<Probe> {
    let mut probes = Vec::with_capacity(3);

    if let Some(size) = info.read_size {
        probes.push(Probe {
            pc: info.pc,
            operand: Operand::Read,
            size,
            access: Access::Read,
        });

        if info.has_second_read {
            // Both read operands share the instruction's read size
            probes.push(Probe {
                pc: info.pc,
                operand: Operand::SecondRead,
                size,
                access: Access::Read,
            });
        }
    }

    if let Some(size) = info.write_size {
        probes.push(Probe {
            pc: info.pc,
            operand: Operand::Write,
            size,
            access: Access::Write,
        });
    }

    // A read-only instruction gets no bare record: its read record already counts it
    if !info.has_memory_operand() && mode == RecordMode::AllInstructions {
        probes.push(Probe {
            pc: info.pc,
            operand: Operand::None,
            size: 0,
            access: Access::Write,
        });
    }

    probes
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_read_modify_write() {
        let info = InstructionInfo {
            pc: 0x40,
            read_size: Some(4),
            has_second_read: false,
            write_size: Some(4),
        };
        let probes = plan(&info, RecordMode::AllInstructions);
        let operands: Vec<Operand> = probes.iter().map(|p| p.operand).collect();
        assert_eq!(operands, vec![Operand::Read, Operand::Write]);
    }

    #[test]
    fn test_dual_read_produces_two_records() {
        let info = InstructionInfo {
            pc: 0x40,
            read_size: Some(8),
            has_second_read: true,
            write_size: None,
        };
        let tid = ThreadId::new(0);
        let probes = plan(&info, RecordMode::MemoryOnly);
        assert_eq!(probes.len(), 2);

        let first = probes[0].record(0x1000, tid);
        let second = probes[1].record(0x2000, tid);
        assert_eq!(first, MemoryAccessRecord::read(0x40, 0x1000, 8, tid));
        assert_eq!(second, MemoryAccessRecord::read(0x40, 0x2000, 8, tid));
    }

    #[test]
    fn test_bare_instruction_depends_on_mode() {
        let info = InstructionInfo {
            pc: 0x44,
            ..Default::default()
        };
        assert!(plan(&info, RecordMode::MemoryOnly).is_empty());

        let probes = plan(&info, RecordMode::AllInstructions);
        assert_eq!(probes.len(), 1);
        let record = probes[0].record(0xdead, ThreadId::new(2));
        assert!(record.is_sentinel());
        assert_eq!(record.pc(), 0x44);
    }

    #[test]
    fn test_read_only_instruction_gets_no_bare_record() {
        let info = InstructionInfo {
            pc: 0x48,
            read_size: Some(2),
            ..Default::default()
        };
        let probes = plan(&info, RecordMode::AllInstructions);
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].operand, Operand::Read);
        assert!(!probes[0].record(0x3000, ThreadId::new(0)).is_sentinel());
    }
}
