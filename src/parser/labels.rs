use std::collections::{BTreeMap, HashMap};

/// Looks up a human readable name for an address.
pub trait SymbolResolver {
    fn name_for(&self, address: u16) -> Option<String>;

    /// The label, or the address as `XXXXh` when there is none.
    fn name_or_hex(&self, address: u16) -> String {
        self.name_for(address)
            .unwrap_or_else(|| format!("{:04X}h", address))
    }
}

/// Labels keyed by address. The first label registered for an address wins.
#[derive(Debug, Default, Clone)]
pub struct LabelTable {
    by_address: HashMap<u16, Vec<String>>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, address: u16) {
        self.by_address
            .entry(address)
            .or_default()
            .push(name.to_string());
    }

    pub fn labels_for(&self, address: u16) -> &[String] {
        self.by_address
            .get(&address)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_address.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

impl From<&BTreeMap<String, u16>> for LabelTable {
    fn from(map: &BTreeMap<String, u16>) -> Self {
        let mut table = LabelTable::new();
        for (name, address) in map {
            table.insert(name, *address);
        }
        table
    }
}

impl SymbolResolver for LabelTable {
    fn name_for(&self, address: u16) -> Option<String> {
        self.labels_for(address).first().cloned()
    }
}
