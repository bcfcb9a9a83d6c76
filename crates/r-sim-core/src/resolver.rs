//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Detection and re-translation of structural parameters."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use strum::Display;
use tracing::{debug, info, warn};

use crate::model_id::ModelIdentifier;
use crate::setup::SimulationSetup;

/// Engine wording that follows the line naming a structural parameter.
pub const STRUCTURAL_MARKER: &str =
    "After translation you can only set literal start-values and non-evaluated parameters";

/// Extracts structural parameter names from engine diagnostics.
pub trait DiagnosticParser: Send + fmt::Debug {
    /// Ordered, de-duplicated parameter names.
    fn structural_parameters(&self, log: &str) -> Vec<String>;
}

/// Line-based parser: a marker line names its parameter on the preceding
/// line, wrapped in a fixed prefix and suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationLogParser {
    marker: String,
    prefix: String,
    suffix: String,
}

impl TranslationLogParser {
    pub fn new(
        marker: impl Into<String>,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            marker: marker.into(),
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }
}

impl Default for TranslationLogParser {
    fn default() -> Self {
        Self::new(
            STRUCTURAL_MARKER,
            "Warning: Setting ",
            " has no effect in model.",
        )
    }
}

impl DiagnosticParser for TranslationLogParser {
    fn structural_parameters(&self, log: &str) -> Vec<String> {
        let lines: Vec<&str> = log.lines().collect();
        let mut found: Vec<String> = Vec::new();
        for pair in lines.windows(2) {
            if !pair[1].contains(&self.marker) {
                continue;
            }
            let previous = pair[0].trim();
            let previous = previous.strip_prefix(&self.prefix).unwrap_or(previous);
            let name = previous.strip_suffix(&self.suffix).unwrap_or(previous).trim();
            if !name.is_empty() && !found.iter().any(|f| f == name) {
                found.push(name.to_owned());
            }
        }
        found
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ResolverState {
    Idle,
    Detecting,
    Retranslating,
    Exhausted,
}

/// Outcome of inspecting one run's diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionPlan {
    /// Nothing structural in the log.
    Nothing,
    /// Parameters were found but not all of them are set through `initial_names`.
    Unresolvable(Vec<String>),
    /// Re-load `model` and run again.
    Retranslate {
        parameters: Vec<String>,
        model: ModelIdentifier,
    },
    /// The same parameters survived a re-translation, or the round budget is spent.
    Recurring(Vec<String>),
}

/// Drives the detect / re-translate pass after a run.
#[derive(Debug)]
pub struct StructuralParameterResolver {
    parser: Box<dyn DiagnosticParser>,
    state: ResolverState,
    max_rounds: u32,
    rounds: u32,
    known: Vec<String>,
}

impl Default for StructuralParameterResolver {
    fn default() -> Self {
        Self::new(Box::new(TranslationLogParser::default()))
    }
}

impl StructuralParameterResolver {
    pub fn new(parser: Box<dyn DiagnosticParser>) -> Self {
        Self {
            parser,
            state: ResolverState::Idle,
            max_rounds: 1,
            rounds: 0,
            known: Vec::new(),
        }
    }

    /// Allow up to `rounds` re-translations per simulation call (at least one).
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    pub fn state(&self) -> ResolverState {
        self.state
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Structural parameters discovered so far for the active model.
    pub fn known(&self) -> &[String] {
        &self.known
    }

    /// Start a new simulation call.
    pub fn begin(&mut self) {
        self.rounds = 0;
        self.state = ResolverState::Idle;
    }

    /// Forget discovered parameters, e.g. after switching models.
    pub fn reset(&mut self) {
        self.begin();
        self.known.clear();
    }

    /// Identifier carrying the known structural parameters with the setup's
    /// current values, or `None` when it equals `current`.
    pub fn prepare(
        &self,
        current: &ModelIdentifier,
        setup: &SimulationSetup,
    ) -> Option<ModelIdentifier> {
        if self.known.is_empty() {
            return None;
        }
        let row = setup.initial_values().first().map(Vec::as_slice).unwrap_or(&[]);
        let next =
            ModelIdentifier::with_structural(current.base(), &self.known, setup.initial_names(), row);
        (next != *current).then_some(next)
    }

    /// Inspect the diagnostics of a run against `model` executed with `setup`.
    pub fn inspect(
        &mut self,
        log: &str,
        setup: &SimulationSetup,
        model: &ModelIdentifier,
    ) -> ResolutionPlan {
        if log.trim().is_empty() {
            return ResolutionPlan::Nothing;
        }
        self.state = ResolverState::Detecting;
        let parameters = self.parser.structural_parameters(log);
        if parameters.is_empty() {
            self.state = ResolverState::Idle;
            return ResolutionPlan::Nothing;
        }
        debug!(model = %model, parameters = %parameters.join(", "), "structural parameters detected");

        let names = setup.initial_names();
        if !parameters.iter().all(|p| names.contains(p)) {
            self.state = ResolverState::Idle;
            warn!(
                model = %model,
                parameters = %parameters.join(", "),
                "structural parameters are not part of initial_names; nothing to re-translate"
            );
            return ResolutionPlan::Unresolvable(parameters);
        }

        let already_applied = parameters
            .iter()
            .all(|p| model.modifiers().iter().any(|(name, _)| name == p));
        if already_applied || self.rounds >= self.max_rounds {
            self.state = ResolverState::Idle;
            warn!(
                model = %model,
                parameters = %parameters.join(", "),
                rounds = self.rounds,
                "structural parameters persist after re-translation; add annotation(Evaluate=false) to these parameters"
            );
            return ResolutionPlan::Recurring(parameters);
        }

        for parameter in &parameters {
            if !self.known.contains(parameter) {
                self.known.push(parameter.clone());
            }
        }
        warn_on_diverging_rows(setup, &self.known);

        self.rounds += 1;
        self.state = ResolverState::Retranslating;
        let row = setup.initial_values().first().map(Vec::as_slice).unwrap_or(&[]);
        let next = ModelIdentifier::with_structural(model.base(), &self.known, names, row);
        info!(model = %next, round = self.rounds, "re-translating model with structural modifiers");
        ResolutionPlan::Retranslate {
            parameters,
            model: next,
        }
    }

    /// The re-translated model loaded.
    pub fn retranslated(&mut self) {
        self.state = ResolverState::Idle;
    }

    /// The re-translated model failed to load.
    pub fn exhausted(&mut self) {
        self.state = ResolverState::Exhausted;
    }
}

fn warn_on_diverging_rows(setup: &SimulationSetup, structural: &[String]) {
    let rows = setup.initial_values();
    let Some(first) = rows.first() else {
        return;
    };
    for parameter in structural {
        let Some(column) = setup.initial_names().iter().position(|n| n == parameter) else {
            continue;
        };
        if rows.iter().any(|row| row.get(column) != first.get(column)) {
            warn!(
                parameter = %parameter,
                "structural parameter differs across the batch; only the first row's value is compiled in"
            );
        }
    }
}
