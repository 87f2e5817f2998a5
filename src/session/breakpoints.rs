//! Breakpoint ledger
//!
//! The canonical record of every breakpoint the user asked for, independent
//! of any adapter. It outlives sessions: entries added while no session is
//! active are flushed when the next one starts.
//!
//! Adapters define breakpoints per unit (one source file, or all function
//! breakpoints, ...) rather than incrementally, so every change is synced as
//! the complete batch for the affected unit.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{Error, Result};
use crate::dap::types::{
    self, DataBreakpoint, ExceptionBreakpointsFilter, ExceptionFilterOptions, FunctionBreakpoint,
    InstructionBreakpoint, SetBreakpointsArguments, SetDataBreakpointsArguments,
    SetExceptionBreakpointsArguments, SetFunctionBreakpointsArguments,
    SetInstructionBreakpointsArguments, Source, SourceBreakpoint,
};

/// Current version of the persisted store format
const STORE_VERSION: u32 = 1;

/// Where a breakpoint stops
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakpointLocation {
    /// A line (and optionally column) in a source file
    Source {
        path: PathBuf,
        line: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<u32>,
    },
    /// Entry of a named function
    Function { name: String },
    /// A raw instruction address
    Instruction {
        reference: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<i64>,
    },
    /// A data watchpoint on an adapter-provided data id
    Data {
        data_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_type: Option<String>,
    },
    /// Break when an exception of an adapter-defined category is thrown
    Exception { filter: String },
}

impl BreakpointLocation {
    /// Parse a location string
    ///
    /// - `file.rs:42` or `file.rs:42:7` for a source line
    /// - `*0x4005d0` or `*0x4005d0+8` for an instruction address
    /// - `data:<id>` or `data:<id>@write` for a data breakpoint
    /// - `exception:<filter>` for an exception filter such as `uncaught`
    /// - anything else is a function name
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidLocation("empty location".to_string()));
        }

        if let Some(addr) = s.strip_prefix('*') {
            let (reference, offset) = match addr.split_once('+') {
                Some((base, off)) => {
                    let off: i64 = off.trim().parse().map_err(|_| {
                        Error::InvalidLocation(format!("invalid instruction offset: {}", off))
                    })?;
                    (base.trim(), Some(off))
                }
                None => (addr.trim(), None),
            };
            if reference.is_empty() {
                return Err(Error::InvalidLocation(s.to_string()));
            }
            return Ok(Self::Instruction {
                reference: reference.to_string(),
                offset,
            });
        }

        if let Some(filter) = s.strip_prefix("exception:") {
            let filter = filter.trim();
            if filter.is_empty() {
                return Err(Error::InvalidLocation(s.to_string()));
            }
            return Ok(Self::Exception {
                filter: filter.to_string(),
            });
        }

        if let Some(rest) = s.strip_prefix("data:") {
            let (data_id, access_type) = match rest.split_once('@') {
                Some((id, access)) => (id, Some(access.to_string())),
                None => (rest, None),
            };
            if data_id.is_empty() {
                return Err(Error::InvalidLocation(s.to_string()));
            }
            return Ok(Self::Data {
                data_id: data_id.to_string(),
                access_type,
            });
        }

        // file:line[:column], careful with Windows paths like "C:\src\main.rs:10"
        if let Some((head, last)) = split_numeric_suffix(s) {
            let (path, line, column) = match split_numeric_suffix(head) {
                Some((path, line)) => (path, line, Some(last)),
                None => (head, last, None),
            };
            if line == 0 {
                return Err(Error::InvalidLocation(format!("line numbers start at 1: {}", s)));
            }
            return Ok(Self::Source {
                path: PathBuf::from(path),
                line,
                column,
            });
        }

        Ok(Self::Function {
            name: s.to_string(),
        })
    }

    /// The unit this location is synced with
    pub fn unit(&self) -> BreakpointUnit {
        match self {
            Self::Source { path, .. } => BreakpointUnit::Source(path.clone()),
            Self::Function { .. } => BreakpointUnit::Functions,
            Self::Instruction { .. } => BreakpointUnit::Instructions,
            Self::Data { .. } => BreakpointUnit::Data,
            Self::Exception { .. } => BreakpointUnit::Exceptions,
        }
    }
}

/// Split `head:123` into `("head", 123)` when the suffix is all digits
fn split_numeric_suffix(s: &str) -> Option<(&str, u32)> {
    let (head, tail) = s.rsplit_once(':')?;
    if head.is_empty() || tail.is_empty() || !tail.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((head, tail.parse().ok()?))
}

impl std::fmt::Display for BreakpointLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source {
                path,
                line,
                column: Some(column),
            } => write!(f, "{}:{}:{}", path.display(), line, column),
            Self::Source { path, line, .. } => write!(f, "{}:{}", path.display(), line),
            Self::Function { name } => write!(f, "{}", name),
            Self::Instruction {
                reference,
                offset: Some(offset),
            } => write!(f, "*{}+{}", reference, offset),
            Self::Instruction { reference, .. } => write!(f, "*{}", reference),
            Self::Data {
                data_id,
                access_type: Some(access),
            } => write!(f, "data:{}@{}", data_id, access),
            Self::Data { data_id, .. } => write!(f, "data:{}", data_id),
            Self::Exception { filter } => write!(f, "exception:{}", filter),
        }
    }
}

/// The granularity at which adapters accept breakpoints
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointUnit {
    Source(PathBuf),
    Functions,
    Instructions,
    Data,
    Exceptions,
}

impl BreakpointUnit {
    /// Key used in the persisted store
    pub fn key(&self) -> String {
        match self {
            BreakpointUnit::Source(path) => path.display().to_string(),
            BreakpointUnit::Functions => "<functions>".to_string(),
            BreakpointUnit::Instructions => "<instructions>".to_string(),
            BreakpointUnit::Data => "<data>".to_string(),
            BreakpointUnit::Exceptions => "<exceptions>".to_string(),
        }
    }

    /// DAP command that replaces this unit's breakpoints
    pub fn command(&self) -> &'static str {
        match self {
            BreakpointUnit::Source(_) => "setBreakpoints",
            BreakpointUnit::Functions => "setFunctionBreakpoints",
            BreakpointUnit::Instructions => "setInstructionBreakpoints",
            BreakpointUnit::Data => "setDataBreakpoints",
            BreakpointUnit::Exceptions => "setExceptionBreakpoints",
        }
    }
}

impl std::fmt::Display for BreakpointUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// What the user asked for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointSpec {
    pub location: BreakpointLocation,
    /// Passed to the adapter unmodified; never evaluated locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
    /// Turns the breakpoint into a logpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl BreakpointSpec {
    pub fn new(location: BreakpointLocation) -> Self {
        Self {
            location,
            condition: None,
            hit_condition: None,
            log_message: None,
            enabled: true,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_hit_condition(mut self, hit_condition: impl Into<String>) -> Self {
        self.hit_condition = Some(hit_condition.into());
        self
    }

    pub fn with_log_message(mut self, message: impl Into<String>) -> Self {
        self.log_message = Some(message.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn is_conditional(&self) -> bool {
        self.condition.is_some() || self.hit_condition.is_some()
    }
}

/// Warning for a conditional breakpoint the adapter left unverified
fn unverified_warning(entry: &BreakpointEntry) -> Option<BreakpointWarning> {
    if entry.binding.bound || !entry.spec.is_conditional() {
        return None;
    }
    Some(BreakpointWarning {
        id: entry.id,
        location: entry.spec.location.to_string(),
        message: entry
            .binding
            .message
            .clone()
            .unwrap_or_else(|| "condition could not be verified by the adapter".to_string()),
    })
}

/// What the adapter last said about a breakpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Binding {
    /// Only ever set from an adapter acknowledgment
    pub bound: bool,
    pub adapter_id: Option<i64>,
    /// Line the adapter actually placed the breakpoint on, if relocated
    pub line: Option<u32>,
    pub message: Option<String>,
}

/// A breakpoint in the ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakpointEntry {
    pub id: u32,
    pub spec: BreakpointSpec,
    pub binding: Binding,
}

impl BreakpointEntry {
    pub fn location(&self) -> &BreakpointLocation {
        &self.spec.location
    }

    pub fn is_bound(&self) -> bool {
        self.binding.bound
    }
}

/// Non-fatal problem the adapter reported for one breakpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakpointWarning {
    pub id: u32,
    pub location: String,
    pub message: String,
}

/// The full set of breakpoints for one unit, ready to send
#[derive(Debug, Clone)]
pub struct SyncBatch {
    pub unit: BreakpointUnit,
    /// Ledger ids in the order they appear in `arguments`
    pub ids: Vec<u32>,
    pub arguments: Value,
    /// Enabled entries left out because the adapter cannot take them
    pub skipped: Vec<BreakpointWarning>,
}

impl SyncBatch {
    pub fn command(&self) -> &'static str {
        self.unit.command()
    }
}

/// Result of applying an adapter `breakpoint` event
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterUpdate {
    pub id: u32,
    pub unit: BreakpointUnit,
    /// Set when the event left a conditional breakpoint unverified
    pub warning: Option<BreakpointWarning>,
}

/// Saved copy of the ledger used to roll back a rejected change
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    entries: BTreeMap<u32, BreakpointEntry>,
}

/// Persisted form: ordered breakpoint records keyed by unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakpointStore {
    pub version: u32,
    pub units: BTreeMap<String, Vec<BreakpointSpec>>,
}

/// Canonical breakpoint record, shared across sessions
#[derive(Debug, Default)]
pub struct BreakpointLedger {
    entries: BTreeMap<u32, BreakpointEntry>,
    next_id: u32,
}

impl BreakpointLedger {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn find_location(&self, location: &BreakpointLocation) -> Option<u32> {
        self.entries
            .values()
            .find(|e| &e.spec.location == location)
            .map(|e| e.id)
    }

    /// Add a breakpoint, rejecting a second one at an identical location
    pub fn add(&mut self, spec: BreakpointSpec) -> Result<u32> {
        if self.find_location(&spec.location).is_some() {
            return Err(Error::duplicate(&spec.location));
        }

        let id = self.next_id.max(1);
        self.next_id = id + 1;
        tracing::debug!(id, location = %spec.location, "Breakpoint added");
        self.entries.insert(
            id,
            BreakpointEntry {
                id,
                spec,
                binding: Binding::default(),
            },
        );
        Ok(id)
    }

    pub fn remove(&mut self, id: u32) -> Result<BreakpointEntry> {
        self.entries
            .remove(&id)
            .ok_or(Error::BreakpointNotFound { id })
    }

    /// Replace what the user asked for, keeping the id
    ///
    /// Returns the units that need resending (two if the location moved to
    /// another unit).
    pub fn update(&mut self, id: u32, spec: BreakpointSpec) -> Result<Vec<BreakpointUnit>> {
        if let Some(other) = self.find_location(&spec.location) {
            if other != id {
                return Err(Error::duplicate(&spec.location));
            }
        }
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(Error::BreakpointNotFound { id })?;

        let old_unit = entry.spec.location.unit();
        let new_unit = spec.location.unit();
        if entry.spec.location != spec.location {
            entry.binding = Binding::default();
        }
        entry.spec = spec;

        let mut units = vec![old_unit];
        if !units.contains(&new_unit) {
            units.push(new_unit);
        }
        Ok(units)
    }

    pub fn set_enabled(&mut self, id: u32, enabled: bool) -> Result<BreakpointUnit> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(Error::BreakpointNotFound { id })?;
        entry.spec.enabled = enabled;
        if !enabled {
            entry.binding = Binding::default();
        }
        Ok(entry.spec.location.unit())
    }

    /// Enable or disable everything; returns the units that changed
    pub fn set_all_enabled(&mut self, enabled: bool) -> Vec<BreakpointUnit> {
        let mut changed = BTreeSet::new();
        for entry in self.entries.values_mut() {
            if entry.spec.enabled != enabled {
                entry.spec.enabled = enabled;
                if !enabled {
                    entry.binding = Binding::default();
                }
                changed.insert(entry.spec.location.unit());
            }
        }
        changed.into_iter().collect()
    }

    /// Replace every breakpoint of one unit with `specs`
    ///
    /// Entries whose location survives keep their id. Returns the ids of the
    /// unit in the order given.
    pub fn replace_unit(&mut self, unit: &BreakpointUnit, specs: Vec<BreakpointSpec>) -> Result<Vec<u32>> {
        for (i, spec) in specs.iter().enumerate() {
            if &spec.location.unit() != unit {
                return Err(Error::InvalidLocation(format!(
                    "{} does not belong to {}",
                    spec.location, unit
                )));
            }
            if specs[..i].iter().any(|s| s.location == spec.location) {
                return Err(Error::duplicate(&spec.location));
            }
        }

        let mut existing: BTreeMap<u32, BreakpointEntry> = BTreeMap::new();
        self.entries.retain(|id, entry| {
            if &entry.spec.location.unit() == unit {
                existing.insert(*id, entry.clone());
                false
            } else {
                true
            }
        });

        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let kept = existing
                .values()
                .find(|e| e.spec.location == spec.location)
                .map(|e| e.id);
            match kept {
                Some(id) => {
                    let mut entry = existing.remove(&id).ok_or(Error::BreakpointNotFound { id })?;
                    entry.spec = spec;
                    self.entries.insert(id, entry);
                    ids.push(id);
                }
                None => ids.push(self.add(spec)?),
            }
        }
        Ok(ids)
    }

    /// Drop every breakpoint of a unit (e.g. when its source is closed)
    ///
    /// The unit still needs one more (empty) sync to clear the adapter side.
    pub fn remove_unit(&mut self, unit: &BreakpointUnit) -> Vec<BreakpointEntry> {
        let ids: Vec<u32> = self.list_for(unit).iter().map(|e| e.id).collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    pub fn get(&self, id: u32) -> Option<&BreakpointEntry> {
        self.entries.get(&id)
    }

    /// Breakpoints of one unit, ordered by id
    pub fn list_for(&self, unit: &BreakpointUnit) -> Vec<BreakpointEntry> {
        self.entries
            .values()
            .filter(|e| &e.spec.location.unit() == unit)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<BreakpointEntry> {
        self.entries.values().cloned().collect()
    }

    /// Every unit that has at least one breakpoint
    pub fn units(&self) -> Vec<BreakpointUnit> {
        let units: BTreeSet<_> = self
            .entries
            .values()
            .map(|e| e.spec.location.unit())
            .collect();
        units.into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Build the complete batch for a unit; disabled entries are left out
    ///
    /// Exception entries are sent as-is; see [`Self::batch_with_filters`].
    pub fn batch_for(&self, unit: &BreakpointUnit) -> Result<SyncBatch> {
        self.batch_with_filters(unit, None)
    }

    /// Build the complete batch for a unit against the exception filters the
    /// adapter offers
    ///
    /// Exception entries naming a filter that is not offered, or carrying a
    /// condition the filter does not support, are left out and reported in
    /// [`SyncBatch::skipped`]. `None` means the offer is unknown.
    pub fn batch_with_filters(
        &self,
        unit: &BreakpointUnit,
        offered: Option<&[ExceptionBreakpointsFilter]>,
    ) -> Result<SyncBatch> {
        let enabled: Vec<&BreakpointEntry> = self
            .entries
            .values()
            .filter(|e| e.spec.enabled && &e.spec.location.unit() == unit)
            .collect();
        let ids = enabled.iter().map(|e| e.id).collect();

        let arguments = match unit {
            BreakpointUnit::Source(path) => serde_json::to_value(SetBreakpointsArguments {
                source: Source {
                    name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
                    path: Some(path.display().to_string()),
                    source_reference: None,
                },
                breakpoints: enabled
                    .iter()
                    .filter_map(|e| match &e.spec.location {
                        BreakpointLocation::Source { line, column, .. } => Some(SourceBreakpoint {
                            line: *line,
                            column: *column,
                            condition: e.spec.condition.clone(),
                            hit_condition: e.spec.hit_condition.clone(),
                            log_message: e.spec.log_message.clone(),
                        }),
                        _ => None,
                    })
                    .collect(),
            })?,
            BreakpointUnit::Functions => serde_json::to_value(SetFunctionBreakpointsArguments {
                breakpoints: enabled
                    .iter()
                    .filter_map(|e| match &e.spec.location {
                        BreakpointLocation::Function { name } => Some(FunctionBreakpoint {
                            name: name.clone(),
                            condition: e.spec.condition.clone(),
                            hit_condition: e.spec.hit_condition.clone(),
                        }),
                        _ => None,
                    })
                    .collect(),
            })?,
            BreakpointUnit::Instructions => {
                serde_json::to_value(SetInstructionBreakpointsArguments {
                    breakpoints: enabled
                        .iter()
                        .filter_map(|e| match &e.spec.location {
                            BreakpointLocation::Instruction { reference, offset } => {
                                Some(InstructionBreakpoint {
                                    instruction_reference: reference.clone(),
                                    offset: *offset,
                                    condition: e.spec.condition.clone(),
                                    hit_condition: e.spec.hit_condition.clone(),
                                })
                            }
                            _ => None,
                        })
                        .collect(),
                })?
            }
            BreakpointUnit::Data => serde_json::to_value(SetDataBreakpointsArguments {
                breakpoints: enabled
                    .iter()
                    .filter_map(|e| match &e.spec.location {
                        BreakpointLocation::Data {
                            data_id,
                            access_type,
                        } => Some(DataBreakpoint {
                            data_id: data_id.clone(),
                            access_type: access_type.clone(),
                            condition: e.spec.condition.clone(),
                            hit_condition: e.spec.hit_condition.clone(),
                        }),
                        _ => None,
                    })
                    .collect(),
            })?,
            BreakpointUnit::Exceptions => return exception_batch(&enabled, offered),
        };

        Ok(SyncBatch {
            unit: unit.clone(),
            ids,
            arguments,
            skipped: Vec::new(),
        })
    }

    /// Merge the adapter's answer to a batch back into the ledger
    ///
    /// The response lists breakpoints in request order. Returns a warning for
    /// each conditional breakpoint the adapter could not verify.
    pub fn merge_bound(&mut self, batch: &SyncBatch, response: &[types::Breakpoint]) -> Vec<BreakpointWarning> {
        // Exception filters may be acknowledged without a breakpoint list;
        // a successful empty answer accepts every filter sent
        let accepted_all = batch.unit == BreakpointUnit::Exceptions && response.is_empty();
        if response.len() != batch.ids.len() && !accepted_all {
            tracing::warn!(
                unit = %batch.unit,
                sent = batch.ids.len(),
                received = response.len(),
                "Adapter answered with a different number of breakpoints"
            );
        }

        let mut warnings = Vec::new();
        for (index, id) in batch.ids.iter().enumerate() {
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };
            entry.binding = match response.get(index) {
                Some(bp) => Binding {
                    bound: bp.verified,
                    adapter_id: bp.id,
                    line: bp.line,
                    message: bp.message.clone(),
                },
                None if accepted_all => Binding {
                    bound: true,
                    ..Binding::default()
                },
                None => Binding::default(),
            };
            warnings.extend(unverified_warning(entry));
        }

        for skipped in &batch.skipped {
            if let Some(entry) = self.entries.get_mut(&skipped.id) {
                entry.binding = Binding {
                    message: Some(skipped.message.clone()),
                    ..Binding::default()
                };
            }
            warnings.push(skipped.clone());
        }

        // Disabled entries of the unit were not sent and cannot be bound
        for entry in self.entries.values_mut() {
            if !entry.spec.enabled && entry.spec.location.unit() == batch.unit {
                entry.binding = Binding::default();
            }
        }
        warnings
    }

    /// Apply an adapter `breakpoint` event
    ///
    /// Matched by the adapter-assigned id. Unknown ids are ignored.
    pub fn apply_adapter_update(&mut self, bp: &types::Breakpoint) -> Option<AdapterUpdate> {
        let adapter_id = bp.id?;
        let entry = self
            .entries
            .values_mut()
            .find(|e| e.binding.adapter_id == Some(adapter_id))?;

        entry.binding.bound = bp.verified;
        if bp.line.is_some() {
            entry.binding.line = bp.line;
        }
        if bp.message.is_some() {
            entry.binding.message = bp.message.clone();
        }
        Some(AdapterUpdate {
            id: entry.id,
            unit: entry.spec.location.unit(),
            warning: unverified_warning(entry),
        })
    }

    /// Forget all adapter state, ready for the next session
    pub fn reset_bound(&mut self) {
        for entry in self.entries.values_mut() {
            entry.binding = Binding::default();
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            entries: self.entries.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: LedgerSnapshot) {
        self.entries = snapshot.entries;
    }

    /// Persisted form of the ledger
    pub fn export(&self) -> BreakpointStore {
        let mut units: BTreeMap<String, Vec<BreakpointSpec>> = BTreeMap::new();
        for entry in self.entries.values() {
            units
                .entry(entry.spec.location.unit().key())
                .or_default()
                .push(entry.spec.clone());
        }
        BreakpointStore {
            version: STORE_VERSION,
            units,
        }
    }

    /// Add every record of a store, skipping ones already present
    ///
    /// Returns how many were added.
    pub fn import(&mut self, store: BreakpointStore) -> usize {
        let mut added = 0;
        for (key, specs) in store.units {
            for spec in specs {
                match self.add(spec) {
                    Ok(_) => added += 1,
                    Err(e) => tracing::debug!(unit = %key, "Skipping stored breakpoint: {}", e),
                }
            }
        }
        added
    }

    /// Write the ledger as JSON
    ///
    /// An existing store is always overwritten, so removals persist. An empty
    /// ledger does not create a store that was never there.
    pub fn save(&self, path: &Path) -> Result<()> {
        if self.is_empty() && !path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.export())?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), count = self.len(), "Saved breakpoints");
        Ok(())
    }

    /// Read a JSON store and import it; a missing file imports nothing
    pub fn load(&mut self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        let store: BreakpointStore = serde_json::from_str(&content)?;
        if store.version > STORE_VERSION {
            return Err(Error::Config(format!(
                "breakpoint store version {} is newer than supported ({})",
                store.version, STORE_VERSION
            )));
        }
        Ok(self.import(store))
    }
}

/// `setExceptionBreakpoints` batch: plain filters first, then filters with
/// a condition, which is also the order the adapter answers in
fn exception_batch(
    enabled: &[&BreakpointEntry],
    offered: Option<&[ExceptionBreakpointsFilter]>,
) -> Result<SyncBatch> {
    let mut plain = Vec::new();
    let mut conditional = Vec::new();
    let mut skipped = Vec::new();

    for entry in enabled {
        let BreakpointLocation::Exception { filter } = &entry.spec.location else {
            continue;
        };
        let known = offered.map(|filters| filters.iter().find(|f| &f.filter == filter));
        let problem = match (known, &entry.spec.condition) {
            (Some(None), _) => Some(format!("adapter offers no exception filter '{}'", filter)),
            (Some(Some(f)), Some(_)) if !f.supports_condition => {
                Some(format!("exception filter '{}' does not support conditions", filter))
            }
            _ => None,
        };
        if let Some(message) = problem {
            skipped.push(BreakpointWarning {
                id: entry.id,
                location: entry.spec.location.to_string(),
                message,
            });
            continue;
        }
        match &entry.spec.condition {
            Some(condition) => conditional.push((entry.id, filter, condition)),
            None => plain.push((entry.id, filter)),
        }
    }

    let ids = plain
        .iter()
        .map(|(id, _)| *id)
        .chain(conditional.iter().map(|(id, _, _)| *id))
        .collect();
    let arguments = serde_json::to_value(SetExceptionBreakpointsArguments {
        filters: plain.iter().map(|(_, f)| f.to_string()).collect(),
        filter_options: conditional
            .iter()
            .map(|(_, f, condition)| ExceptionFilterOptions {
                filter_id: f.to_string(),
                condition: Some(condition.to_string()),
            })
            .collect(),
    })?;

    Ok(SyncBatch {
        unit: BreakpointUnit::Exceptions,
        ids,
        arguments,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(path: &str, line: u32) -> BreakpointSpec {
        BreakpointSpec::new(BreakpointLocation::Source {
            path: PathBuf::from(path),
            line,
            column: None,
        })
    }

    fn verified(id: i64, line: u32) -> types::Breakpoint {
        types::Breakpoint {
            id: Some(id),
            verified: true,
            message: None,
            source: None,
            line: Some(line),
            column: None,
        }
    }

    #[test]
    fn test_parse_locations() {
        assert_eq!(
            BreakpointLocation::parse("src/main.rs:42").unwrap(),
            BreakpointLocation::Source {
                path: PathBuf::from("src/main.rs"),
                line: 42,
                column: None
            }
        );
        assert_eq!(
            BreakpointLocation::parse("main.c:10:5").unwrap(),
            BreakpointLocation::Source {
                path: PathBuf::from("main.c"),
                line: 10,
                column: Some(5)
            }
        );
        assert_eq!(
            BreakpointLocation::parse(r"C:\src\main.rs:7").unwrap().unit(),
            BreakpointUnit::Source(PathBuf::from(r"C:\src\main.rs"))
        );
        assert_eq!(
            BreakpointLocation::parse("mymod::Type::method").unwrap(),
            BreakpointLocation::Function {
                name: "mymod::Type::method".to_string()
            }
        );
        assert_eq!(
            BreakpointLocation::parse("*0x4005d0+8").unwrap(),
            BreakpointLocation::Instruction {
                reference: "0x4005d0".to_string(),
                offset: Some(8)
            }
        );
        assert_eq!(
            BreakpointLocation::parse("data:counter@write").unwrap().to_string(),
            "data:counter@write"
        );
        assert!(BreakpointLocation::parse("main.c:0").is_err());
        assert!(BreakpointLocation::parse("   ").is_err());
    }

    #[test]
    fn test_duplicates_rejected_in_any_order() {
        let mut a = BreakpointLedger::new();
        a.add(source("a.c", 1)).unwrap();
        a.add(source("a.c", 2)).unwrap();
        assert!(matches!(
            a.add(source("a.c", 1)),
            Err(Error::DuplicateBreakpoint { .. })
        ));

        let mut b = BreakpointLedger::new();
        b.add(source("a.c", 2)).unwrap();
        b.add(source("a.c", 1)).unwrap();
        assert!(matches!(
            b.add(source("a.c", 2)),
            Err(Error::DuplicateBreakpoint { .. })
        ));

        // Same location with a different condition is still a duplicate
        assert!(b.add(source("a.c", 1).with_condition("x > 1")).is_err());
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_batch_contains_full_unit_in_order() {
        let mut ledger = BreakpointLedger::new();
        let first = ledger.add(source("a.c", 30).with_condition("i == 3")).unwrap();
        ledger.add(source("b.c", 5)).unwrap();
        let off = ledger.add(source("a.c", 10).disabled()).unwrap();
        let third = ledger.add(source("a.c", 20)).unwrap();

        let batch = ledger
            .batch_for(&BreakpointUnit::Source(PathBuf::from("a.c")))
            .unwrap();
        assert_eq!(batch.ids, vec![first, third]);
        assert!(!batch.ids.contains(&off));
        assert_eq!(batch.command(), "setBreakpoints");
        assert_eq!(batch.arguments["source"]["path"], "a.c");
        assert_eq!(batch.arguments["breakpoints"][0]["line"], 30);
        assert_eq!(batch.arguments["breakpoints"][0]["condition"], "i == 3");
        assert_eq!(batch.arguments["breakpoints"][1]["line"], 20);
    }

    #[test]
    fn test_empty_unit_batch_clears_adapter_side() {
        let mut ledger = BreakpointLedger::new();
        let id = ledger.add(source("a.c", 3)).unwrap();
        ledger.remove(id).unwrap();

        let batch = ledger
            .batch_for(&BreakpointUnit::Source(PathBuf::from("a.c")))
            .unwrap();
        assert!(batch.ids.is_empty());
        assert_eq!(batch.arguments["breakpoints"], serde_json::json!([]));
    }

    #[test]
    fn test_bound_only_from_acknowledgment() {
        let mut ledger = BreakpointLedger::new();
        let id = ledger.add(source("a.c", 3)).unwrap();
        let unit = BreakpointUnit::Source(PathBuf::from("a.c"));
        assert!(!ledger.get(id).unwrap().is_bound());

        let batch = ledger.batch_for(&unit).unwrap();
        // No answer for the entry: stays unbound
        ledger.merge_bound(&batch, &[]);
        assert!(!ledger.get(id).unwrap().is_bound());

        ledger.merge_bound(&batch, &[verified(7, 4)]);
        let entry = ledger.get(id).unwrap();
        assert!(entry.is_bound());
        assert_eq!(entry.binding.line, Some(4));
        assert_eq!(entry.binding.adapter_id, Some(7));

        let listed_once = ledger.list_for(&unit);
        assert_eq!(listed_once, ledger.list_for(&unit));

        ledger.reset_bound();
        assert!(!ledger.get(id).unwrap().is_bound());
    }

    #[test]
    fn test_unverified_condition_produces_warning() {
        let mut ledger = BreakpointLedger::new();
        let plain = ledger.add(source("a.c", 3)).unwrap();
        let cond = ledger.add(source("a.c", 9).with_condition("x ==")).unwrap();
        let batch = ledger
            .batch_for(&BreakpointUnit::Source(PathBuf::from("a.c")))
            .unwrap();

        let rejected = types::Breakpoint {
            id: Some(2),
            verified: false,
            message: Some("syntax error in condition".to_string()),
            source: None,
            line: None,
            column: None,
        };
        let warnings = ledger.merge_bound(&batch, &[verified(1, 3), rejected]);

        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].id, cond);
        assert_eq!(warnings[0].message, "syntax error in condition");
        assert!(ledger.get(plain).unwrap().is_bound());
    }

    #[test]
    fn test_adapter_update_by_adapter_id() {
        let mut ledger = BreakpointLedger::new();
        let id = ledger.add(source("a.c", 3)).unwrap();
        let unit = BreakpointUnit::Source(PathBuf::from("a.c"));
        let batch = ledger.batch_for(&unit).unwrap();
        let mut pending = verified(11, 3);
        pending.verified = false;
        ledger.merge_bound(&batch, &[pending]);

        let update = ledger.apply_adapter_update(&verified(11, 5)).unwrap();
        assert_eq!((update.id, update.unit), (id, unit));
        assert_eq!(update.warning, None);
        assert!(ledger.get(id).unwrap().is_bound());
        assert_eq!(ledger.get(id).unwrap().binding.line, Some(5));
        assert_eq!(ledger.apply_adapter_update(&verified(99, 1)), None);
    }

    #[test]
    fn test_adapter_unverifying_condition_warns() {
        let mut ledger = BreakpointLedger::new();
        let plain = ledger.add(source("a.c", 3)).unwrap();
        let cond = ledger.add(source("a.c", 8).with_hit_condition("> 2")).unwrap();
        let batch = ledger
            .batch_for(&BreakpointUnit::Source(PathBuf::from("a.c")))
            .unwrap();
        assert!(ledger.merge_bound(&batch, &[verified(1, 3), verified(2, 8)]).is_empty());

        let mut revoked = verified(2, 8);
        revoked.verified = false;
        revoked.message = Some("hit condition no longer valid".to_string());
        let update = ledger.apply_adapter_update(&revoked).unwrap();
        assert_eq!(update.id, cond);
        let warning = update.warning.unwrap();
        assert_eq!(warning.location, "a.c:8");
        assert_eq!(warning.message, "hit condition no longer valid");
        assert!(!ledger.get(cond).unwrap().is_bound());

        // Plain breakpoints change binding silently
        let mut moved = verified(1, 3);
        moved.verified = false;
        let update = ledger.apply_adapter_update(&moved).unwrap();
        assert_eq!(update.id, plain);
        assert_eq!(update.warning, None);
    }

    #[test]
    fn test_exception_batch_against_offered_filters() {
        let mut ledger = BreakpointLedger::new();
        let uncaught = ledger
            .add(BreakpointSpec::new(BreakpointLocation::parse("exception:uncaught").unwrap()))
            .unwrap();
        let raised = ledger
            .add(
                BreakpointSpec::new(BreakpointLocation::parse("exception:raised").unwrap())
                    .with_condition("ValueError"),
            )
            .unwrap();
        let unknown = ledger
            .add(BreakpointSpec::new(BreakpointLocation::parse("exception:signal").unwrap()))
            .unwrap();
        let offered = vec![
            ExceptionBreakpointsFilter {
                filter: "raised".to_string(),
                label: "Raised Exceptions".to_string(),
                default: false,
                supports_condition: true,
            },
            ExceptionBreakpointsFilter {
                filter: "uncaught".to_string(),
                label: "Uncaught Exceptions".to_string(),
                default: true,
                supports_condition: false,
            },
        ];

        let batch = ledger
            .batch_with_filters(&BreakpointUnit::Exceptions, Some(&offered))
            .unwrap();
        assert_eq!(batch.command(), "setExceptionBreakpoints");
        assert_eq!(batch.ids, vec![uncaught, raised]);
        assert_eq!(batch.arguments["filters"], serde_json::json!(["uncaught"]));
        assert_eq!(batch.arguments["filterOptions"][0]["filterId"], "raised");
        assert_eq!(batch.arguments["filterOptions"][0]["condition"], "ValueError");
        assert_eq!(batch.skipped.len(), 1);
        assert_eq!(batch.skipped[0].id, unknown);

        // An answer without a breakpoint list accepts every filter sent
        let warnings = ledger.merge_bound(&batch, &[]);
        assert!(ledger.get(uncaught).unwrap().is_bound());
        assert!(ledger.get(raised).unwrap().is_bound());
        assert!(!ledger.get(unknown).unwrap().is_bound());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("signal"));
    }

    #[test]
    fn test_enable_disable() {
        let mut ledger = BreakpointLedger::new();
        let a = ledger.add(source("a.c", 1)).unwrap();
        ledger.add(BreakpointSpec::new(BreakpointLocation::parse("main").unwrap())).unwrap();

        assert_eq!(
            ledger.set_enabled(a, false).unwrap(),
            BreakpointUnit::Source(PathBuf::from("a.c"))
        );
        assert!(ledger.set_enabled(42, true).is_err());

        let changed = ledger.set_all_enabled(false);
        assert_eq!(changed, vec![BreakpointUnit::Functions]);
        let changed = ledger.set_all_enabled(true);
        assert_eq!(changed.len(), 2);
    }

    #[test]
    fn test_update_moves_between_units() {
        let mut ledger = BreakpointLedger::new();
        let id = ledger.add(source("a.c", 1)).unwrap();
        ledger.add(source("b.c", 1)).unwrap();

        assert!(ledger.update(id, source("b.c", 1)).is_err());
        let units = ledger.update(id, source("c.c", 4)).unwrap();
        assert_eq!(
            units,
            vec![
                BreakpointUnit::Source(PathBuf::from("a.c")),
                BreakpointUnit::Source(PathBuf::from("c.c"))
            ]
        );
        assert_eq!(ledger.get(id).unwrap().location().to_string(), "c.c:4");
    }

    #[test]
    fn test_replace_unit_keeps_surviving_ids() {
        let mut ledger = BreakpointLedger::new();
        let unit = BreakpointUnit::Source(PathBuf::from("a.c"));
        let keep = ledger.add(source("a.c", 1)).unwrap();
        let gone = ledger.add(source("a.c", 2)).unwrap();
        let other = ledger.add(source("b.c", 2)).unwrap();

        let ids = ledger
            .replace_unit(&unit, vec![source("a.c", 5), source("a.c", 1)])
            .unwrap();
        assert_eq!(ids[1], keep);
        assert!(ledger.get(gone).is_none());
        assert!(ledger.get(other).is_some());

        assert!(ledger
            .replace_unit(&unit, vec![source("a.c", 5), source("a.c", 5)])
            .is_err());
        assert!(ledger.replace_unit(&unit, vec![source("b.c", 9)]).is_err());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut ledger = BreakpointLedger::new();
        ledger.add(source("a.c", 1)).unwrap();
        let snapshot = ledger.snapshot();
        ledger.add(source("a.c", 2)).unwrap();
        ledger.restore(snapshot);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("breakpoints.json");

        let mut ledger = BreakpointLedger::new();
        ledger.add(source("src/a.c", 12).with_condition("n > 2")).unwrap();
        ledger.add(source("src/a.c", 4)).unwrap();
        ledger
            .add(BreakpointSpec::new(BreakpointLocation::parse("main").unwrap()).disabled())
            .unwrap();
        ledger.save(&path).unwrap();

        let mut restored = BreakpointLedger::new();
        assert_eq!(restored.load(&path).unwrap(), 3);
        assert_eq!(restored.export(), ledger.export());
        assert!(restored.all().iter().all(|e| !e.is_bound()));

        // Loading again adds nothing new
        assert_eq!(restored.load(&path).unwrap(), 0);
        assert_eq!(restored.load(&dir.path().join("missing.json")).unwrap(), 0);
    }

    #[test]
    fn test_save_after_removing_everything_clears_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breakpoints.json");

        let mut ledger = BreakpointLedger::new();
        let id = ledger.add(source("a.c", 7)).unwrap();
        ledger.save(&path).unwrap();
        ledger.remove(id).unwrap();
        ledger.save(&path).unwrap();

        let mut restored = BreakpointLedger::new();
        assert_eq!(restored.load(&path).unwrap(), 0);
        assert!(restored.is_empty());

        // Nothing to keep and nothing stored: no file appears
        let fresh = dir.path().join("fresh.json");
        BreakpointLedger::new().save(&fresh).unwrap();
        assert!(!fresh.exists());
    }
}
