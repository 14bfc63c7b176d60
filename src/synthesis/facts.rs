//! Key-fact carry-over between sections

use std::collections::VecDeque;

use super::sections::{ReportSection, SectionKey};

/// Bounded ledger of facts from finalized sections; oldest facts drop first
#[derive(Debug, Clone)]
pub struct KeyFactLedger {
    max_chars: usize,
    facts: VecDeque<(SectionKey, String)>,
    used_chars: usize,
}

impl KeyFactLedger {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            facts: VecDeque::new(),
            used_chars: 0,
        }
    }

    fn line_len(key: SectionKey, fact: &str) -> usize {
        // "- [key] fact\n"
        key.as_str().len() + fact.chars().count() + 6
    }

    /// Fallback sections carry no facts
    pub fn push_section(&mut self, section: &ReportSection) {
        if section.is_fallback() {
            return;
        }
        for fact in &section.key_facts {
            let len = Self::line_len(section.key, fact);
            if len > self.max_chars {
                continue;
            }
            self.used_chars += len;
            self.facts.push_back((section.key, fact.clone()));
            while self.used_chars > self.max_chars {
                let Some((key, dropped)) = self.facts.pop_front() else {
                    break;
                };
                self.used_chars -= Self::line_len(key, &dropped);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn render(&self) -> String {
        if self.facts.is_empty() {
            return "(no prior sections)".to_string();
        }
        self.facts
            .iter()
            .map(|(key, fact)| format!("- [{}] {}\n", key, fact))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::sections::SectionState;

    fn section(key: SectionKey, facts: &[&str], state: SectionState) -> ReportSection {
        ReportSection {
            key,
            title: key.to_string(),
            body: String::new(),
            key_facts: facts.iter().map(|f| f.to_string()).collect(),
            state,
            attempts: 1,
            fallback_reason: None,
            corrections: Vec::new(),
        }
    }

    #[test]
    fn test_ledger_is_bounded() {
        let mut ledger = KeyFactLedger::new(60);
        ledger.push_section(&section(
            SectionKey::Summary,
            &["first fact here", "second fact here"],
            SectionState::Done,
        ));
        ledger.push_section(&section(
            SectionKey::Risk,
            &["third fact here"],
            SectionState::Done,
        ));

        let rendered = ledger.render();
        assert!(rendered.chars().count() <= 60);
        assert!(!rendered.contains("first fact"));
        assert!(rendered.contains("- [risk] third fact here"));
    }

    #[test]
    fn test_fallback_contributes_nothing() {
        let mut ledger = KeyFactLedger::new(1_000);
        ledger.push_section(&section(
            SectionKey::Metadata,
            &["unverified"],
            SectionState::Fallback,
        ));
        assert!(ledger.is_empty());
        assert_eq!(ledger.render(), "(no prior sections)");
    }
}
