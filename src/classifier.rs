// 🏷️ Classifier - rules as data over reconciled fields
//
// Every matching rule votes for a category; the highest priority wins.
// Two different categories at the top priority is a contradiction →
// unknown + review. No matching rule → unknown + review.

use crate::entity::{BusinessStatus, Category, Field, OpeningStatus, ParkEntity};
use crate::provenance::SourceTag;
use anyhow::{Context as AnyhowContext, Result};
use log::warn;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Closure wording in names and notes
const CLOSED_PATTERN: &str =
    r"\b(permanently closed|closed permanently|closed down|no longer operating|demolished|disused)\b";

// ============================================================================
// RULE DEFINITION
// ============================================================================

/// Text a condition looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Name,
    OperatorBrand,
    Tourism,
    Website,
    Notes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Case-insensitive regex must match
    Matches { signal: Signal, pattern: String },

    /// Case-insensitive regex must not match (a missing signal passes)
    NotMatches { signal: Signal, pattern: String },

    /// Some, but not all, sites are permanent
    PartialPermanent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRule {
    /// Rule ID for tracking
    pub id: String,

    pub category: Category,

    /// All must hold
    pub when: Vec<Condition>,

    /// Priority (higher wins)
    #[serde(default)]
    pub priority: i32,

    pub description: Option<String>,
}

/// Rule with its patterns compiled
struct CompiledRule {
    rule: ClassificationRule,
    checks: Vec<Check>,
}

enum Check {
    Matches(Signal, Regex),
    NotMatches(Signal, Regex),
    PartialPermanent,
}

impl CompiledRule {
    fn compile(rule: ClassificationRule) -> Result<Self> {
        let checks = rule
            .when
            .iter()
            .map(|c| -> Result<Check> {
                Ok(match c {
                    Condition::Matches { signal, pattern } => Check::Matches(*signal, compile(pattern)?),
                    Condition::NotMatches { signal, pattern } => Check::NotMatches(*signal, compile(pattern)?),
                    Condition::PartialPermanent => Check::PartialPermanent,
                })
            })
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Invalid pattern in rule '{}'", rule.id))?;
        Ok(CompiledRule { rule, checks })
    }

    fn matches(&self, park: &ParkEntity) -> bool {
        !self.checks.is_empty()
            && self.checks.iter().all(|check| match check {
                Check::Matches(signal, re) => signal_text(park, *signal).map(|t| re.is_match(&t)).unwrap_or(false),
                Check::NotMatches(signal, re) => !signal_text(park, *signal).map(|t| re.is_match(&t)).unwrap_or(false),
                Check::PartialPermanent => {
                    match (park.count(Field::SitesPermanent), park.count(Field::SitesTotal)) {
                        (Some(permanent), Some(total)) => permanent > 0 && permanent < total,
                        (Some(permanent), None) => permanent > 0,
                        _ => false,
                    }
                }
            })
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .with_context(|| format!("Bad regex: {}", pattern))
}

fn signal_text(park: &ParkEntity, signal: Signal) -> Option<String> {
    let text = match signal {
        Signal::Name => park.text(Field::Name).map(str::to_string),
        Signal::OperatorBrand => park.text(Field::OperatorBrand).map(str::to_string),
        Signal::Tourism => park.text(Field::Tourism).map(str::to_string),
        Signal::Website => park.text(Field::Website).map(str::to_string),
        Signal::Notes => Some(park.notes.join(" ")),
    };
    text.filter(|t| !t.trim().is_empty())
}

/// Built-in rule table
pub fn default_rules() -> Vec<ClassificationRule> {
    let rule = |id: &str, category, priority, when: Vec<Condition>, description: &str| ClassificationRule {
        id: id.to_string(),
        category,
        when,
        priority,
        description: Some(description.to_string()),
    };
    let matches = |signal, pattern: &str| Condition::Matches {
        signal,
        pattern: pattern.to_string(),
    };

    vec![
        rule(
            "mixed_notes",
            Category::Mixed,
            30,
            vec![matches(Signal::Notes, r"\b(permanent|long-stay|long stay)\b")],
            "Permanent or long-stay residents mentioned",
        ),
        rule(
            "mixed_sites",
            Category::Mixed,
            30,
            vec![Condition::PartialPermanent],
            "Part of the sites are permanent",
        ),
        rule(
            "built_community",
            Category::BuiltCommunity,
            25,
            vec![matches(
                Signal::Name,
                r"\b(lifestyle|over\s*50s|retirement|village|manufactured\s*home)\b",
            )],
            "Residential land-lease community",
        ),
        rule(
            "camp_site",
            Category::Camp,
            20,
            vec![
                matches(Signal::Tourism, r"^camp_site$"),
                Condition::NotMatches {
                    signal: Signal::Name,
                    pattern: "caravan".to_string(),
                },
            ],
            "Camp site without caravan in the name",
        ),
        rule(
            "holiday_brand",
            Category::Holiday,
            15,
            vec![matches(
                Signal::OperatorBrand,
                r"^(big ?4|nrma|discovery|g'?day|reflections|ingenia holidays|tasman|holiday haven)\b",
            )],
            "Holiday park brand",
        ),
        rule(
            "caravan_site",
            Category::Holiday,
            10,
            vec![matches(Signal::Tourism, r"^(caravan_site|camp_site)$")],
            "Tagged as a caravan site",
        ),
    ]
}

// ============================================================================
// CLASSIFICATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: Category,
    pub opening_status: OpeningStatus,
    pub needs_review: bool,
    pub confidence: f64,
    /// Winning rule, if exactly one category won
    pub rule_id: Option<String>,
    pub reasons: Vec<String>,
}

// ============================================================================
// RULE ENGINE
// ============================================================================

pub struct RuleEngine {
    rules: Vec<CompiledRule>,
    closed: Option<Regex>,
}

impl RuleEngine {
    /// Engine with no rules: everything is unknown
    pub fn new() -> Self {
        RuleEngine {
            rules: Vec::new(),
            closed: compile(CLOSED_PATTERN).ok(),
        }
    }

    /// Load rules from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read rules file: {:?}", path.as_ref()))?;

        let rules: Vec<ClassificationRule> =
            serde_json::from_str(&content).context("Failed to parse rules JSON")?;

        RuleEngine::from_rules(rules)
    }

    pub fn from_rules(rules: Vec<ClassificationRule>) -> Result<Self> {
        let mut engine = RuleEngine::new();
        for rule in rules {
            engine.add_rule(rule)?;
        }
        Ok(engine)
    }

    pub fn add_rule(&mut self, rule: ClassificationRule) -> Result<()> {
        self.rules.push(CompiledRule::compile(rule)?);
        // Re-sort by priority
        self.rules.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn classify(&self, park: &ParkEntity) -> Classification {
        let mut reasons = Vec::new();

        let matched: Vec<&ClassificationRule> = self
            .rules
            .iter()
            .filter(|r| r.matches(park))
            .map(|r| &r.rule)
            .collect();

        let (category, rule_id) = match matched.first() {
            None => {
                reasons.push("no classification signal".to_string());
                (Category::Unknown, None)
            }
            Some(top) => {
                let contenders: Vec<&&ClassificationRule> =
                    matched.iter().filter(|r| r.priority == top.priority).collect();
                let disagree = contenders.iter().any(|r| r.category != top.category);
                if disagree {
                    let ids: Vec<&str> = contenders.iter().map(|r| r.id.as_str()).collect();
                    reasons.push(format!("contradictory rules: {}", ids.join(", ")));
                    (Category::Unknown, None)
                } else {
                    (top.category, Some(top.id.clone()))
                }
            }
        };

        let opening_status = self.opening_status(park);

        let name_missing = park.text(Field::Name).is_none();
        if name_missing {
            reasons.push("name missing".to_string());
        }
        if category == Category::Mixed {
            reasons.push("mixed use".to_string());
        }
        reasons.extend(park.review_reasons.iter().cloned());

        let needs_review = matches!(category, Category::Unknown | Category::Mixed)
            || name_missing
            || !park.review_reasons.is_empty();

        Classification {
            category,
            opening_status,
            needs_review,
            confidence: confidence_for(park),
            rule_id,
            reasons,
        }
    }

    /// Classify and write the result onto the park
    pub fn apply(&self, park: &mut ParkEntity) -> Classification {
        let result = self.classify(park);
        park.category = result.category;
        park.opening_status = result.opening_status;
        park.needs_review = result.needs_review;
        park.confidence = result.confidence;
        result
    }

    /// A directory's permanent closure first, then closure wording, then
    /// evidence of trading
    fn opening_status(&self, park: &ParkEntity) -> OpeningStatus {
        let business = park.text(Field::BusinessStatus).and_then(BusinessStatus::from_str);
        if business == Some(BusinessStatus::ClosedPermanently) {
            return OpeningStatus::Closed;
        }
        if let Some(closed) = &self.closed {
            let said_closed = [Signal::Name, Signal::Notes]
                .iter()
                .filter_map(|s| signal_text(park, *s))
                .any(|t| closed.is_match(&t));
            if said_closed {
                return OpeningStatus::Closed;
            }
        }
        if business == Some(BusinessStatus::Operational) || park.contributors.contains(&SourceTag::BrandDirectory) {
            OpeningStatus::Open
        } else {
            OpeningStatus::Unknown
        }
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        RuleEngine::from_rules(default_rules()).unwrap_or_else(|e| {
            warn!("Built-in classification rules failed to compile: {:#}", e);
            RuleEngine::new()
        })
    }
}

/// 0.6 for a single source, +0.2 per extra independent source, capped
fn confidence_for(park: &ParkEntity) -> f64 {
    let sources = park.contributors.len();
    if sources == 0 {
        return 0.0;
    }
    let raw = (0.4 + 0.2 * sources as f64).min(0.95);
    (raw * 100.0).round() / 100.0
}

// ============================================================================
// TESTS
// ============================================================================
