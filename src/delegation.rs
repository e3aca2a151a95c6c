//! Sentinel protocol between reasoning stages.
//!
//! A router-stage backend hands work off by starting its reply with
//!
//! ```text
//! ||DELEGATE||: FINANCE SYS - Log an expense of 500 for food.
//! ||SEARCH||: weather in Pune tomorrow
//! ```
//!
//! All sentinel parsing lives here. Anything that does not parse cleanly is plain text.

use serde::{Deserialize, Serialize};

pub const DELEGATE_MARKER: &str = "||DELEGATE||:";
pub const SEARCH_MARKER: &str = "||SEARCH||:";

const TARGET_SEPARATOR: &str = " - ";

/// Keyword expansion for one subsystem name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemKeywords {
    /// Matched by case-insensitive membership in the target token.
    pub subsystem: String,
    pub keywords: String,
}

impl SubsystemKeywords {
    pub fn new(subsystem: impl Into<String>, keywords: impl Into<String>) -> Self {
        Self {
            subsystem: subsystem.into(),
            keywords: keywords.into(),
        }
    }
}

/// Default vocabulary bridges between subsystem names and capability wording.
pub fn default_subsystems() -> Vec<SubsystemKeywords> {
    vec![
        SubsystemKeywords::new(
            "FINANCE",
            "expense income transaction payment payee money spend account balance add_transaction get_transactions",
        ),
        SubsystemKeywords::new(
            "TASK",
            "task todo section due date reschedule complete create_task update_task get_tasks",
        ),
        SubsystemKeywords::new(
            "HEALTH",
            "health water intake sleep period dashboard log_water get_health_dashboard log_period",
        ),
        SubsystemKeywords::new(
            "NUTRITION",
            "meal food calories kcal breakfast lunch dinner log_meal get_nutrition_today",
        ),
        SubsystemKeywords::new(
            "JOURNAL",
            "journal diary entry today reflection save_journal get_journal_today",
        ),
        SubsystemKeywords::new(
            "MEMORY",
            "memory note remember critical reminder save_memory get_memories",
        ),
        SubsystemKeywords::new(
            "CONTENT",
            "content watchlist movie book show article add_content get_content",
        ),
        SubsystemKeywords::new(
            "DEVICE",
            "phone alarm timer call contact open app media music whatsapp sms",
        ),
    ]
}

/// What a reasoning backend's text asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegationResult {
    Delegate {
        target: String,
        instruction: String,
        /// Instruction plus the matched subsystem's keywords; what the selector sees.
        expanded: String,
    },
    Search {
        query: String,
    },
    Plain,
}

pub struct DelegationParser {
    subsystems: Vec<SubsystemKeywords>,
}

impl DelegationParser {
    pub fn new(subsystems: Vec<SubsystemKeywords>) -> Self {
        Self { subsystems }
    }

    pub fn parse(&self, text: &str) -> DelegationResult {
        let trimmed = text.trim_start();

        if let Some(rest) = trimmed.strip_prefix(DELEGATE_MARKER) {
            return self.parse_delegate(rest).unwrap_or(DelegationResult::Plain);
        }

        if let Some(rest) = trimmed.strip_prefix(SEARCH_MARKER) {
            let query = rest.trim();
            if query.is_empty() {
                return DelegationResult::Plain;
            }
            return DelegationResult::Search {
                query: query.to_string(),
            };
        }

        DelegationResult::Plain
    }

    fn parse_delegate(&self, rest: &str) -> Option<DelegationResult> {
        let (target, instruction) = rest.split_once(TARGET_SEPARATOR)?;
        let target = target.trim();
        let instruction = instruction.trim();
        if target.is_empty() || instruction.is_empty() {
            return None;
        }

        let expanded = match self.keywords_for(target) {
            Some(keywords) => format!("{instruction} {keywords}"),
            None => instruction.to_string(),
        };

        Some(DelegationResult::Delegate {
            target: target.to_string(),
            instruction: instruction.to_string(),
            expanded,
        })
    }

    /// Keyword expansion of the first subsystem whose name occurs in `target`.
    pub fn keywords_for(&self, target: &str) -> Option<&str> {
        let upper = target.to_uppercase();
        self.subsystems
            .iter()
            .find(|s| upper.contains(&s.subsystem.to_uppercase()))
            .map(|s| s.keywords.as_str())
    }

    pub fn subsystem_names(&self) -> Vec<&str> {
        self.subsystems.iter().map(|s| s.subsystem.as_str()).collect()
    }
}

impl Default for DelegationParser {
    fn default() -> Self {
        Self::new(default_subsystems())
    }
}
