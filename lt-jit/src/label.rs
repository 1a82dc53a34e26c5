use serde::Serialize;
use tracing::trace;

use crate::error::{JitError, JitResult};

/// Opaque handle to a code position that may not be known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Label(u32);

impl Label {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// How a pending reference is encoded at its site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// x86 32-bit displacement relative to the end of the field.
    Rel32,
    /// AArch64 `b`/`bl` 26-bit word displacement.
    Branch26,
    /// x86 `movabs` 64-bit immediate.
    Abs64,
    /// AArch64 `movz` + three `movk`, 16 bits each.
    MovWide64,
}

impl RelocKind {
    /// Absolute relocations depend on the final base address and are only
    /// resolved when the session ends.
    pub fn is_absolute(self) -> bool {
        matches!(self, RelocKind::Abs64 | RelocKind::MovWide64)
    }

    /// Width of the patched field in bytes.
    pub fn len(self) -> usize {
        match self {
            RelocKind::Rel32 | RelocKind::Branch26 => 4,
            RelocKind::Abs64 => 8,
            RelocKind::MovWide64 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reloc {
    pub site: usize,
    pub label: Label,
    pub kind: RelocKind,
}

#[derive(Debug, Default)]
struct LabelEntry {
    bound: Option<usize>,
    pending: Vec<(usize, RelocKind)>,
}

#[derive(Debug, Default)]
pub struct LabelTable {
    entries: Vec<LabelEntry>,
    absolute: Vec<Reloc>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self) -> Label {
        let label = Label(self.entries.len() as u32);
        self.entries.push(LabelEntry::default());
        label
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn offset(&self, label: Label) -> JitResult<Option<usize>> {
        Ok(self.entry(label)?.bound)
    }

    /// Binds `label` at `offset` and hands back every queued pc-relative
    /// use so the caller can patch them.
    pub fn bind(&mut self, label: Label, offset: usize) -> JitResult<Vec<Reloc>> {
        let entry = self.entry_mut(label)?;
        if entry.bound.is_some() {
            return Err(JitError::LabelAlreadyBound(label));
        }
        entry.bound = Some(offset);
        let pending = std::mem::take(&mut entry.pending);
        trace!(%label, offset, patches = pending.len(), "bound label");
        Ok(pending
            .into_iter()
            .map(|(site, kind)| Reloc { site, label, kind })
            .collect())
    }

    pub fn add_use(&mut self, reloc: Reloc) -> JitResult<()> {
        if reloc.kind.is_absolute() {
            self.entry(reloc.label)?;
            self.absolute.push(reloc);
            return Ok(());
        }
        let entry = self.entry_mut(reloc.label)?;
        if entry.bound.is_some() {
            return Err(JitError::InvalidOperand(format!(
                "relative use of already bound label {}",
                reloc.label
            )));
        }
        entry.pending.push((reloc.site, reloc.kind));
        Ok(())
    }

    pub fn first_unbound(&self) -> Option<Label> {
        self.entries
            .iter()
            .position(|entry| entry.bound.is_none())
            .map(|index| Label(index as u32))
    }

    pub fn take_absolute(&mut self) -> Vec<Reloc> {
        std::mem::take(&mut self.absolute)
    }

    pub fn bound_offsets(&self) -> Vec<(Label, usize)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.bound.map(|offset| (Label(index as u32), offset)))
            .collect()
    }

    fn entry(&self, label: Label) -> JitResult<&LabelEntry> {
        self.entries
            .get(label.index())
            .ok_or(JitError::UnknownLabel(label))
    }

    fn entry_mut(&mut self, label: Label) -> JitResult<&mut LabelEntry> {
        self.entries
            .get_mut(label.index())
            .ok_or(JitError::UnknownLabel(label))
    }
}
