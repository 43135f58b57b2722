//! Machine code buffer with forward-referencable labels.
//!
//! A [`Label`] is created unbound, may be referenced any number of times, and
//! must be bound exactly once. Every reference is a 32-bit displacement
//! relative to the end of the 4-byte field, which is what both `jmp/jcc rel32`
//! and RIP-relative addressing use. References are patched in [`CodeBuffer::link`].

use super::JitError;

/// Handle to a position in a [`CodeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

#[derive(Debug, Clone, Copy)]
struct Fixup {
    /// Offset of the 4-byte displacement field.
    at: usize,
    label: Label,
}

#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    /// Bound offset per label.
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Offset at which the next byte will be emitted.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: Label) -> Result<(), JitError> {
        let offset = self.code.len();
        match self.labels.get_mut(label.0 as usize) {
            Some(slot @ None) => {
                *slot = Some(offset);
                Ok(())
            }
            Some(Some(_)) => Err(JitError::LabelLinkedTwice(label.0)),
            None => Err(JitError::UnlinkedLabel(label.0)),
        }
    }

    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Emit a placeholder rel32 field that will point at `label`.
    pub fn emit_label_ref(&mut self, label: Label) {
        self.fixups.push(Fixup {
            at: self.code.len(),
            label,
        });
        self.emit_u32(0);
    }

    /// Patch every reference. Fails if any label was never bound, referenced
    /// or not, or if a displacement does not fit in 32 bits.
    pub fn link(&mut self) -> Result<(), JitError> {
        if let Some(unbound) = self.labels.iter().position(Option::is_none) {
            return Err(JitError::UnlinkedLabel(unbound as u32));
        }
        for fixup in &self.fixups {
            let target = self
                .label_offset(fixup.label)
                .ok_or(JitError::UnlinkedLabel(fixup.label.0))?;
            let rel = target as i64 - (fixup.at as i64 + 4);
            let rel = i32::try_from(rel).map_err(|_| JitError::BranchOutOfRange(rel))?;
            self.code[fixup.at..fixup.at + 4].copy_from_slice(&rel.to_le_bytes());
        }
        self.fixups.clear();
        Ok(())
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Link and hand out the finished bytes.
    pub fn finish(mut self) -> Result<Vec<u8>, JitError> {
        self.link()?;
        Ok(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_little_endian() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.emit_u16(0x1234);
        buf.emit_u32(0xDEADBEEF);
        assert_eq!(buf.code(), &[0x90, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_forward_and_backward_refs() {
        let mut buf = CodeBuffer::new();
        let start = buf.new_label();
        let end = buf.new_label();
        buf.bind(start).unwrap();
        buf.emit_u8(0xE9);
        buf.emit_label_ref(end);
        buf.emit_u8(0xE9);
        buf.emit_label_ref(start);
        buf.bind(end).unwrap();
        let code = buf.finish().unwrap();
        // First jump: field at 1, target 10.
        assert_eq!(&code[1..5], &5i32.to_le_bytes());
        // Second jump: field at 6, target 0.
        assert_eq!(&code[6..10], &(-10i32).to_le_bytes());
    }

    #[test]
    fn test_bind_twice_is_an_error() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        buf.bind(label).unwrap();
        assert_eq!(buf.bind(label), Err(JitError::LabelLinkedTwice(0)));
    }

    #[test]
    fn test_unbound_label_fails_link() {
        let mut buf = CodeBuffer::new();
        let _bound = buf.new_label();
        let unbound = buf.new_label();
        buf.bind(_bound).unwrap();
        buf.emit_label_ref(unbound);
        assert_eq!(buf.finish().unwrap_err(), JitError::UnlinkedLabel(1));
    }

    #[test]
    fn test_unreferenced_unbound_label_fails_link() {
        let mut buf = CodeBuffer::new();
        buf.new_label();
        assert_eq!(buf.finish().unwrap_err(), JitError::UnlinkedLabel(0));
    }
}
