//! Prompt construction for every prompting technique.
//!
//! All generation prompts ask for exactly one query inside a ```` ```sparql ````
//! fenced block; [`crate::extract`] relies on that convention first and falls
//! back to scanning only when a model ignores it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::plan::Plan;

pub const SPARQL_FENCE: &str = "```sparql";

/// Prefixes offered to the model for DBpedia queries.
pub const DBPEDIA_PREFIXES: &str = "\
PREFIX dbo: <http://dbpedia.org/ontology/>
PREFIX dbr: <http://dbpedia.org/resource/>
PREFIX dbp: <http://dbpedia.org/property/>
PREFIX rdf: <http://www.w3.org/1999/02/22-rdf-syntax-ns#>
PREFIX rdfs: <http://www.w3.org/2000/01/rdf-schema#>
PREFIX xsd: <http://www.w3.org/2001/XMLSchema#>
PREFIX foaf: <http://xmlns.com/foaf/0.1/>";

/// How much of an unextractable answer is echoed back in a correction prompt.
const MAX_ECHOED_OUTPUT_CHARS: usize = 1500;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Generation,
    Correction,
    Planning,
    Review,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub kind: PromptKind,
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptError {
    #[error(
        "unsupported prompting technique `{0}` (expected zero_shot, chain_of_thought or dynamic_prompt)"
    )]
    UnsupportedTechnique(String),
    #[error("technique `{0}` needs a plan")]
    MissingPlan(Technique),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Technique {
    ZeroShot,
    ChainOfThought,
    DynamicPrompt,
}

impl Technique {
    pub const ALL: [Technique; 3] = [
        Technique::ZeroShot,
        Technique::ChainOfThought,
        Technique::DynamicPrompt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Technique::ZeroShot => "zero_shot",
            Technique::ChainOfThought => "chain_of_thought",
            Technique::DynamicPrompt => "dynamic_prompt",
        }
    }

    pub fn requires_plan(self) -> bool {
        matches!(self, Technique::ChainOfThought)
    }
}

impl FromStr for Technique {
    type Err = PromptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(|c: char| c == '-' || c == ' ', "_");
        match normalized.as_str() {
            "zero_shot" | "zeroshot" => Ok(Technique::ZeroShot),
            "chain_of_thought" | "cot" | "graph_of_thought" | "got" => {
                Ok(Technique::ChainOfThought)
            }
            "dynamic_prompt" | "dynamic" => Ok(Technique::DynamicPrompt),
            _ => Err(PromptError::UnsupportedTechnique(s.to_string())),
        }
    }
}

impl TryFrom<String> for Technique {
    type Error = PromptError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Technique> for String {
    fn from(t: Technique) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Generation prompts
// ============================================================================

fn base_system_prompt() -> String {
    format!(
        "You are an expert SPARQL generator for the DBpedia knowledge base.\n\
         Convert natural language questions into correct, executable SPARQL queries.\n\
         \n\
         Rules:\n\
         1. Output exactly one SPARQL query inside a single {SPARQL_FENCE} fenced block.\n\
         2. Declare every prefix you use. Common DBpedia prefixes:\n\
         {DBPEDIA_PREFIXES}\n\
         3. Prefer dbo: ontology properties over dbp: raw properties; never invent properties.\n\
         4. Project only the variables that answer the question.\n\
         5. Use ASK for yes/no questions and COUNT for \"how many\" questions."
    )
}

fn question_block(question: &str) -> String {
    format!(
        "Question: {}\n\nReturn ONLY the SPARQL query, in a single {SPARQL_FENCE} block.",
        question.trim()
    )
}

/// Build the first generation prompt for a question.
///
/// `chain_of_thought` requires a plan; the other techniques ignore one.
pub fn build(technique: Technique, question: &str, plan: Option<&Plan>) -> Result<Prompt, PromptError> {
    match technique {
        Technique::ZeroShot => Ok(zero_shot(question)),
        Technique::ChainOfThought => {
            let plan = plan.ok_or(PromptError::MissingPlan(technique))?;
            Ok(chain_of_thought(question, plan))
        }
        Technique::DynamicPrompt => Ok(dynamic(question)),
    }
}

pub fn zero_shot(question: &str) -> Prompt {
    Prompt {
        kind: PromptKind::Generation,
        system: base_system_prompt(),
        user: question_block(question),
    }
}

pub fn chain_of_thought(question: &str, plan: &Plan) -> Prompt {
    let user = format!(
        "A planning step analysed the question:\n\n{}\n\n\
         Follow the reasoning steps and use the resolved URIs where they fit. \
         Entities marked unresolved still need a DBpedia resource.\n\n{}",
        plan.render_for_prompt(),
        question_block(question)
    );
    Prompt {
        kind: PromptKind::Generation,
        system: base_system_prompt(),
        user,
    }
}

pub fn dynamic(question: &str) -> Prompt {
    let shape = classify_question(question);
    let system = format!(
        "{}\n\nThis question is a {} question. {}\n\nExample:\n{}",
        base_system_prompt(),
        shape.label(),
        shape.guidance(),
        shape.example()
    );
    Prompt {
        kind: PromptKind::Generation,
        system,
        user: question_block(question),
    }
}

// ============================================================================
// Dynamic template selection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionShape {
    Count,
    Boolean,
    Superlative,
    Temporal,
    List,
}

const BOOLEAN_OPENERS: &[&str] = &[
    "is", "are", "was", "were", "does", "do", "did", "has", "have", "had", "can", "could",
    "will", "would", "should",
];

const SUPERLATIVES: &[&str] = &[
    "highest", "largest", "biggest", "tallest", "longest", "oldest", "youngest", "smallest",
    "shortest", "lowest", "deepest", "heaviest", "most", "least", "first", "last",
];

impl QuestionShape {
    fn label(self) -> &'static str {
        match self {
            QuestionShape::Count => "counting",
            QuestionShape::Boolean => "yes/no",
            QuestionShape::Superlative => "superlative",
            QuestionShape::Temporal => "date",
            QuestionShape::List => "lookup",
        }
    }

    fn guidance(self) -> &'static str {
        match self {
            QuestionShape::Count => {
                "Answer with SELECT (COUNT(DISTINCT ?x) AS ?count) over the matching resources."
            }
            QuestionShape::Boolean => "Answer with an ASK query; do not SELECT variables.",
            QuestionShape::Superlative => {
                "Bind the compared value, then ORDER BY DESC or ASC on it with LIMIT 1."
            }
            QuestionShape::Temporal => {
                "Select the xsd:date or xsd:gYear literal holding the requested date."
            }
            QuestionShape::List => "SELECT DISTINCT the resources or literals that answer it.",
        }
    }

    fn example(self) -> &'static str {
        match self {
            QuestionShape::Count => {
                "Q: How many moons does Mars have?\n\
                 SELECT (COUNT(DISTINCT ?moon) AS ?count) WHERE { ?moon dbo:satelliteOf dbr:Mars . }"
            }
            QuestionShape::Boolean => {
                "Q: Is Berlin the capital of Germany?\n\
                 ASK WHERE { dbr:Germany dbo:capital dbr:Berlin . }"
            }
            QuestionShape::Superlative => {
                "Q: What is the highest mountain in Italy?\n\
                 SELECT ?uri WHERE { ?uri a dbo:Mountain ; dbo:locatedInArea dbr:Italy ; dbo:elevation ?e . } ORDER BY DESC(?e) LIMIT 1"
            }
            QuestionShape::Temporal => {
                "Q: When was Alan Turing born?\n\
                 SELECT ?date WHERE { dbr:Alan_Turing dbo:birthDate ?date . }"
            }
            QuestionShape::List => {
                "Q: Which rivers flow through Vienna?\n\
                 SELECT DISTINCT ?uri WHERE { ?uri a dbo:River ; dbo:city dbr:Vienna . }"
            }
        }
    }
}

/// Keyword rules, checked in order: count, yes/no, superlative, date, list.
pub fn classify_question(question: &str) -> QuestionShape {
    let lower = question.trim().to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    if lower.starts_with("how many") || lower.contains("number of") {
        return QuestionShape::Count;
    }
    if words.first().is_some_and(|w| BOOLEAN_OPENERS.contains(w)) {
        return QuestionShape::Boolean;
    }
    if words.iter().any(|w| SUPERLATIVES.contains(w)) {
        return QuestionShape::Superlative;
    }
    if words.first() == Some(&"when")
        || lower.contains("what year")
        || lower.contains("which year")
        || lower.contains("what date")
        || lower.contains("birthday")
    {
        return QuestionShape::Temporal;
    }
    QuestionShape::List
}

// ============================================================================
// Correction prompts
// ============================================================================

/// What went wrong with the previous attempt.
#[derive(Debug, Clone, Copy)]
pub enum Rejection<'a> {
    /// A query was extracted and the reviewer said NO.
    Reviewed { sparql: &'a str, rationale: &'a str },
    /// No query could be extracted from the model's answer.
    Unextractable { raw: &'a str, reason: &'a str },
}

/// A correction prompt layered on the base prompt of the session.
///
/// Only the most recent rejection is carried forward.
pub fn correction(base: &Prompt, rejection: Rejection<'_>) -> Prompt {
    let feedback = match rejection {
        Rejection::Reviewed { sparql, rationale } => format!(
            "Your previous query was rejected by a reviewer.\n\n\
             Rejected query:\n{SPARQL_FENCE}\n{}\n```\n\n\
             Reviewer feedback:\n{}",
            sparql.trim(),
            rationale.trim()
        ),
        Rejection::Unextractable { raw, reason } => {
            let echoed: String = raw.trim().chars().take(MAX_ECHOED_OUTPUT_CHARS).collect();
            format!(
                "Your previous answer could not be used ({reason}).\n\n\
                 Previous answer:\n<<<\n{echoed}\n>>>"
            )
        }
    };
    Prompt {
        kind: PromptKind::Correction,
        system: base.system.clone(),
        user: format!(
            "{}\n\n{}\n\nWrite a corrected SPARQL query that answers the question. \
             Return it in a single {SPARQL_FENCE} block.",
            base.user, feedback
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanItem;

    #[test]
    fn technique_aliases() {
        assert_eq!("zero-shot".parse::<Technique>().unwrap(), Technique::ZeroShot);
        assert_eq!("CoT".parse::<Technique>().unwrap(), Technique::ChainOfThought);
        assert_eq!(
            "graph_of_thought".parse::<Technique>().unwrap(),
            Technique::ChainOfThought
        );
        assert_eq!("dynamic".parse::<Technique>().unwrap(), Technique::DynamicPrompt);
        assert_eq!(
            "few_shot".parse::<Technique>(),
            Err(PromptError::UnsupportedTechnique("few_shot".into()))
        );
    }

    #[test]
    fn technique_serde_uses_canonical_names() {
        let json = serde_json::to_string(&Technique::DynamicPrompt).unwrap();
        assert_eq!(json, "\"dynamic_prompt\"");
        let t: Technique = serde_json::from_str("\"cot\"").unwrap();
        assert_eq!(t, Technique::ChainOfThought);
        assert!(serde_json::from_str::<Technique>("\"magic\"").is_err());
    }

    #[test]
    fn zero_shot_asks_for_a_fenced_block() {
        let p = build(Technique::ZeroShot, " Who wrote Dune? ", None).unwrap();
        assert_eq!(p.kind, PromptKind::Generation);
        assert!(p.user.contains("Question: Who wrote Dune?"));
        assert!(p.user.contains(SPARQL_FENCE));
        assert!(p.system.contains("PREFIX dbo:"));
    }

    #[test]
    fn chain_of_thought_embeds_the_plan() {
        assert_eq!(
            build(Technique::ChainOfThought, "q", None),
            Err(PromptError::MissingPlan(Technique::ChainOfThought))
        );
        let plan = Plan {
            entities: vec![PlanItem::new("Dune", Some("dbr:Dune_(novel)"))],
            relations: vec![PlanItem::new("author", Some("dbo:author"))],
            chain_of_thought: vec!["Find the author of the novel.".into()],
        };
        let p = build(Technique::ChainOfThought, "Who wrote Dune?", Some(&plan)).unwrap();
        assert!(p.user.contains("dbr:Dune_(novel)"));
        assert!(p.user.contains("1. Find the author of the novel."));
    }

    #[test]
    fn question_shapes() {
        assert_eq!(classify_question("How many moons does Mars have?"), QuestionShape::Count);
        assert_eq!(classify_question("Give me the number of albums"), QuestionShape::Count);
        assert_eq!(classify_question("Is Berlin in Germany?"), QuestionShape::Boolean);
        assert_eq!(classify_question("Did Tolkien write Dune?"), QuestionShape::Boolean);
        assert_eq!(
            classify_question("What is the tallest building in Dubai?"),
            QuestionShape::Superlative
        );
        assert_eq!(classify_question("When did WWII end?"), QuestionShape::Temporal);
        assert_eq!(classify_question("In which year was Rome founded?"), QuestionShape::Temporal);
        assert_eq!(classify_question("Which rivers cross Vienna?"), QuestionShape::List);
        // "Island" must not read as the yes/no opener "is".
        assert_eq!(classify_question("Island nations in Asia"), QuestionShape::List);
    }

    #[test]
    fn dynamic_prompt_carries_shape_guidance() {
        let p = dynamic("Is Paris the capital of France?");
        assert!(p.system.contains("ASK"));
        assert!(p.system.contains("yes/no question"));
    }

    #[test]
    fn correction_keeps_base_and_latest_rejection() {
        let base = zero_shot("Who wrote Dune?");
        let p = correction(
            &base,
            Rejection::Reviewed {
                sparql: "SELECT ?x WHERE { ?x ?p ?o }",
                rationale: "Does not mention Dune.",
            },
        );
        assert_eq!(p.kind, PromptKind::Correction);
        assert_eq!(p.system, base.system);
        assert!(p.user.starts_with(&base.user));
        assert!(p.user.contains("SELECT ?x WHERE { ?x ?p ?o }"));
        assert!(p.user.contains("Does not mention Dune."));

        let long = "x".repeat(MAX_ECHOED_OUTPUT_CHARS * 2);
        let p = correction(
            &base,
            Rejection::Unextractable {
                raw: &long,
                reason: "no SPARQL query found",
            },
        );
        assert!(p.user.contains("no SPARQL query found"));
        assert!(p.user.len() < base.user.len() + MAX_ECHOED_OUTPUT_CHARS + 400);
    }
}
