use crate::transport::Transport;
use std::collections::HashMap;

/// Per-event cache of the macros the MTA made available.
///
/// The first lookup within an event fetches the whole mapping from the
/// transport, later lookups reuse it until [`MacroCache::invalidate`].
#[derive(Debug, Default)]
pub struct MacroCache {
    macros: Option<HashMap<String, String>>,
}

impl MacroCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `name`, accepting it with or without surrounding braces.
    pub fn get<T: Transport + ?Sized>(&mut self, transport: &mut T, name: &str) -> Option<&str> {
        let macros: &HashMap<String, String> = self
            .macros
            .get_or_insert_with(|| transport.available_macros().unwrap_or_default());
        if let Some(value) = macros.get(name) {
            return Some(value.as_str());
        }
        let alternative = match name.strip_prefix('{').and_then(|n| n.strip_suffix('}')) {
            Some(bare) => bare.to_string(),
            None => format!("{{{name}}}"),
        };
        macros.get(&alternative).map(String::as_str)
    }

    pub fn invalidate(&mut self) {
        self.macros = None;
    }

    pub fn is_fetched(&self) -> bool {
        self.macros.is_some()
    }
}
