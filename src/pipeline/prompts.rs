//! Prompt texts and response schemas for the analysis stages

use serde_json::{Value, json};

use crate::ai::validation::ExpectedShape;

pub const EVIDENCE_MINER_SYSTEM: &str = r#"You are a biomedical forensic auditor. You read clinical and preclinical documents looking for "dark data": negative results, downplayed safety signals and statistical weaknesses buried in the text.

Look for:
- Adverse events dismissed as "not statistically significant"
- Dose reductions, dropouts or withdrawals due to tolerability
- Endpoint changes, post-hoc analyses, p-values just under 0.05
- Experiments mentioned but not reported, missing controls
- Funding conflicts of interest

Give extra attention to supplementary tables, appendices, methods and disclosures.

Risk levels:
- HIGH: clear safety concern, weak primary outcome, major data omission
- MEDIUM: suspicious pattern, inconvenient secondary outcome, minor protocol deviation
- LOW: minor statistical or transparency issue

Rules:
- Quote the text exactly; never paraphrase
- Focus on negative or neutral results, not positive claims
- Return an empty evidence_items array when nothing significant is found"#;

pub const FORENSIC_AUDITOR_SYSTEM: &str = r#"You are a scientific image forensics expert. You inspect figures from biomedical papers for signs of manipulation or fabrication.

Western blots and gels: spliced or duplicated bands, inconsistent backgrounds between lanes, sharp discontinuities.
Charts: identical error bars across groups, points inconsistent with the fitted trend, impossible values.
Microscopy: cloned regions, inconsistent scale bars, unnaturally perfect symmetry.

Mark a figure SUSPICIOUS only with strong evidence. When uncertain, mark it CLEAN with a lower confidence. Use ERROR only when the image cannot be analyzed at all."#;

/// Fields every evidence item must carry
pub const EVIDENCE_FIELDS: &[&str] = &[
    "source",
    "page_estimate",
    "quote",
    "risk_level",
    "risk_type",
    "explanation",
];

pub fn evidence_shape() -> ExpectedShape {
    ExpectedShape::object(&["evidence_items"]).with_list("evidence_items", EVIDENCE_FIELDS)
}

pub fn evidence_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "evidence_items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "source": {"type": "string"},
                        "page_estimate": {"type": "string"},
                        "quote": {"type": "string"},
                        "risk_level": {"type": "string", "enum": ["HIGH", "MEDIUM", "LOW"]},
                        "risk_type": {"type": "string"},
                        "explanation": {"type": "string"}
                    },
                    "required": EVIDENCE_FIELDS
                }
            }
        },
        "required": ["evidence_items"]
    })
}

pub fn evidence_prompt(query: &str, title: &str, chunk: &str, part: usize, parts: usize) -> String {
    let part_note = if parts > 1 {
        format!(" (part {} of {})", part + 1, parts)
    } else {
        String::new()
    };
    format!(
        "Research question: {query}\n\nDocument: {title}{part_note}\n\n<document>\n{chunk}\n</document>\n\nExtract every risk signal relevant to the research question."
    )
}

pub const FORENSIC_FIELDS: &[&str] = &["status", "tampering_risk_score", "findings"];

pub fn forensic_shape() -> ExpectedShape {
    ExpectedShape::object(FORENSIC_FIELDS)
}

pub fn forensic_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "status": {"type": "string", "enum": ["CLEAN", "SUSPICIOUS", "ERROR"]},
            "tampering_risk_score": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "findings": {"type": "string"},
            "model_confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0}
        },
        "required": FORENSIC_FIELDS
    })
}

pub fn forensic_prompt(image_id: &str, source: &str) -> String {
    format!(
        "Analyze figure `{image_id}` from \"{source}\" for signs of data manipulation or fabrication. Report status, tampering_risk_score (0.0 to 1.0), findings and model_confidence."
    )
}
