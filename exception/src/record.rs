//! The exception record: the small, fixed-shape payload that travels from a throw or hardware
//! fault site into the dispatcher and, eventually, into a catch funclet's filter.

use hal::VAddr;

pub const MAX_PARAMETERS: usize = 15;

/// `NotContinuable` mirrors the one flag bit this crate's dispatch policy actually reads: per the
/// non-goals, hardware faults are never resumed at the faulting instruction, so every synthesized
/// record carries it set.
pub const FLAG_NONCONTINUABLE: u32 = 1 << 0;

/// A language-level exception record: a kind code, flags, an optional link to a record it was
/// chained from (nested faults), the address that faulted (or 0 for a plain managed `throw`), and
/// up to 15 kind-specific parameter words.
#[derive(Clone, Copy, Debug)]
pub struct ExceptionRecord {
    pub code: u32,
    pub flags: u32,
    pub chained: Option<VAddr>,
    pub faulting_address: VAddr,
    parameters: [u64; MAX_PARAMETERS],
    parameter_count: usize,
}

impl ExceptionRecord {
    pub fn new(code: u32, flags: u32, faulting_address: VAddr, parameters: &[u64]) -> ExceptionRecord {
        let mut stored = [0u64; MAX_PARAMETERS];
        let count = parameters.len().min(MAX_PARAMETERS);
        stored[..count].copy_from_slice(&parameters[..count]);
        ExceptionRecord { code, flags, chained: None, faulting_address, parameters: stored, parameter_count: count }
    }

    /// Mark this record as raised while another one was already in flight (a fault inside a filter
    /// or Finally/Fault funclet). `chained` is the address of the record it supersedes; nothing in
    /// this crate reads the link back out - it is carried through for whatever the kernel's own
    /// diagnostics or nested-fault policy wants to do with it.
    pub fn chained_from(mut self, chained: VAddr) -> ExceptionRecord {
        self.chained = Some(chained);
        self
    }

    pub fn parameters(&self) -> &[u64] {
        &self.parameters[..self.parameter_count]
    }

    pub fn is_noncontinuable(&self) -> bool {
        self.flags & FLAG_NONCONTINUABLE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_are_truncated_to_capacity() {
        let many: std::vec::Vec<u64> = (0..20).collect();
        let record = ExceptionRecord::new(1, 0, VAddr::new(0), &many);
        assert_eq!(record.parameters().len(), MAX_PARAMETERS);
        assert_eq!(record.parameters()[0], 0);
    }

    #[test]
    fn noncontinuable_flag_is_observed() {
        let record = ExceptionRecord::new(1, FLAG_NONCONTINUABLE, VAddr::new(0), &[]);
        assert!(record.is_noncontinuable());
    }

    #[test]
    fn fresh_record_has_no_chain_link() {
        let record = ExceptionRecord::new(1, 0, VAddr::new(0), &[]);
        assert_eq!(record.chained, None);
    }

    #[test]
    fn chained_from_records_the_superseded_address() {
        let record = ExceptionRecord::new(1, 0, VAddr::new(0), &[]).chained_from(VAddr::new(0x4000));
        assert_eq!(record.chained, Some(VAddr::new(0x4000)));
    }
}
