//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Compiled model identifiers with structural modifiers."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Model name plus the structural modifiers baked in at translation time,
/// rendered as `Package.Model(n = 3,m = 0.5)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelIdentifier {
    base: String,
    modifiers: Vec<(String, f64)>,
}

impl ModelIdentifier {
    /// Build an identifier from a model name. Any modifier suffix already
    /// present in `name` is dropped.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            base: strip_modifiers(name.as_ref()).to_owned(),
            modifiers: Vec::new(),
        }
    }

    /// Recompute an identifier for `base` from scratch.
    ///
    /// Each structural parameter found in `initial_names` contributes one
    /// `name = value` modifier taken from the matching position of `row`.
    /// Parameters without a matching name are skipped.
    pub fn with_structural<S: AsRef<str>>(
        base: impl AsRef<str>,
        structural: &[S],
        initial_names: &[String],
        row: &[f64],
    ) -> Self {
        let mut identifier = Self::new(base);
        for parameter in structural {
            let parameter = parameter.as_ref();
            let Some(position) = initial_names.iter().position(|n| n == parameter) else {
                continue;
            };
            if let Some(value) = row.get(position) {
                identifier.modifiers.push((parameter.to_owned(), *value));
            }
        }
        identifier
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn modifiers(&self) -> &[(String, f64)] {
        &self.modifiers
    }

    pub fn is_modified(&self) -> bool {
        !self.modifiers.is_empty()
    }

    /// Identifier of the unmodified model.
    pub fn unmodified(&self) -> Self {
        Self::new(&self.base)
    }
}

impl fmt::Display for ModelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.modifiers.is_empty() {
            return f.write_str(&self.base);
        }
        let modifiers = self
            .modifiers
            .iter()
            .map(|(name, value)| format!("{name} = {value}"))
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}({})", self.base, modifiers)
    }
}

impl From<&str> for ModelIdentifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

fn strip_modifiers(name: &str) -> &str {
    name.split('(').next().unwrap_or(name).trim()
}
