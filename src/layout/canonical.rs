//! Canonical layouts for platform C types
//!
//! A read-only, process-lifetime table mapping C type names to value
//! layouts matching the host data model. The table is built exactly once
//! and only hands out shared references; there is no mutating API.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::{Carrier, Layout};

/// The canonical `name -> Layout` table for the host platform.
pub struct CanonicalTable {
    entries: BTreeMap<&'static str, Layout>,
}

impl CanonicalTable {
    /// The host table. Initialized on first use, then shared for the
    /// lifetime of the process.
    pub fn host() -> &'static CanonicalTable {
        static TABLE: OnceLock<CanonicalTable> = OnceLock::new();
        TABLE.get_or_init(CanonicalTable::build_host)
    }

    fn build_host() -> CanonicalTable {
        let mut entries = BTreeMap::new();
        entries.insert("bool", Layout::value(Carrier::Bool));
        entries.insert("char", Layout::value(Carrier::I8));
        entries.insert("short", Layout::value(Carrier::I16));
        entries.insert("int", Layout::value(Carrier::I32));
        // LP64 data model on all supported targets.
        entries.insert("long", Layout::value(Carrier::I64));
        entries.insert("long long", Layout::value(Carrier::I64));
        entries.insert("float", Layout::value(Carrier::F32));
        entries.insert("double", Layout::value(Carrier::F64));
        entries.insert("void*", Layout::value(Carrier::Address));
        entries.insert("size_t", Layout::value(Carrier::I64));
        let wchar = if cfg!(windows) {
            Carrier::U16
        } else {
            Carrier::I32
        };
        entries.insert("wchar_t", Layout::value(wchar));
        CanonicalTable { entries }
    }

    /// Look up a canonical layout by C type name.
    pub fn get(&self, name: &str) -> Option<&Layout> {
        self.entries.get(name)
    }

    /// All `(name, layout)` pairs, in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Layout)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }
}
