use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::error::{ClusterError, Result};
use crate::histogram::ValueHistogram;
use crate::partition::{Cell, Member};

pub type TemplateId = u64;

/// Literal values by position, `None` at wildcards
pub type TemplateShape = Vec<Option<String>>;

/// Placeholder used when rendering a template as text
pub const WILDCARD_MARKER: &str = "*";

/// One position of a template
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Literal(String),
    Wildcard(ValueHistogram),
}

impl Slot {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Slot::Wildcard(_))
    }

    #[inline]
    fn accepts(&self, token: &str) -> bool {
        match self {
            Slot::Literal(value) => value == token,
            Slot::Wildcard(_) => true,
        }
    }
}

/// Summary of a terminal cluster: literal tokens, wildcard value tables and a line count.
///
/// Invariant: every wildcard table totals exactly `count`.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    id: TemplateId,
    slots: Vec<Slot>,
    count: u64,
}

impl Template {
    pub fn new(id: TemplateId, slots: Vec<Slot>, count: u64) -> Self {
        Self { id, slots, count }
    }

    /// All-literal template for a single line
    pub fn seed(id: TemplateId, tokens: &[&str]) -> Self {
        Self {
            id,
            slots: tokens
                .iter()
                .map(|token| Slot::Literal((*token).to_string()))
                .collect(),
            count: 1,
        }
    }

    pub fn id(&self) -> TemplateId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: TemplateId) {
        self.id = id;
    }

    /// Number of tokens
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Lines absorbed so far
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn wildcard_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_wildcard())
            .map(|(position, _)| position)
    }

    /// Same length and every literal equals the token at its position
    #[inline]
    pub fn matches(&self, tokens: &[&str]) -> bool {
        self.slots.len() == tokens.len()
            && self
                .slots
                .iter()
                .zip(tokens)
                .all(|(slot, token)| slot.accepts(token))
    }

    /// Literal/wildcard layout with literal values; identifies a template across re-partitions
    pub fn shape(&self) -> TemplateShape {
        self.slots
            .iter()
            .map(|slot| match slot {
                Slot::Literal(value) => Some(value.clone()),
                Slot::Wildcard(_) => None,
            })
            .collect()
    }

    /// Literal positions whose value differs from the token there
    pub fn literal_mismatches(&self, tokens: &[&str]) -> usize {
        self.slots
            .iter()
            .zip(tokens)
            .filter(|(slot, token)| !slot.accepts(token))
            .count()
    }

    /// Some line could match both templates: same length and no position
    /// where both hold different literals.
    pub fn overlaps(&self, other: &Template) -> bool {
        self.slots.len() == other.slots.len()
            && self
                .slots
                .iter()
                .zip(&other.slots)
                .all(|pair| match pair {
                    (Slot::Literal(a), Slot::Literal(b)) => a == b,
                    _ => true,
                })
    }

    /// Fold another template of the same length into this one. Positions
    /// where the literals disagree become wildcards carrying both sides' counts.
    pub fn generalize(&mut self, other: Template) -> Result<()> {
        if other.slots.len() != self.slots.len() {
            return Err(ClusterError::InvariantViolation {
                template_id: self.id,
                position: other.slots.len().min(self.slots.len()),
                expected: format!("{} tokens", self.slots.len()),
                actual: format!("{} tokens", other.slots.len()),
            });
        }

        let own_count = self.count;
        for (slot, incoming) in self.slots.iter_mut().zip(other.slots) {
            let merged = match (std::mem::replace(slot, Slot::Literal(String::new())), incoming) {
                (Slot::Literal(a), Slot::Literal(b)) if a == b => Slot::Literal(a),
                (Slot::Literal(a), Slot::Literal(b)) => {
                    Slot::Wildcard(ValueHistogram::from_counts([(a, own_count), (b, other.count)]))
                }
                (Slot::Literal(a), Slot::Wildcard(table)) => {
                    let mut merged = ValueHistogram::from_counts([(a, own_count)]);
                    merged.merge(table);
                    Slot::Wildcard(merged)
                }
                (Slot::Wildcard(mut table), Slot::Literal(b)) => {
                    table.add_weighted(b, other.count);
                    Slot::Wildcard(table)
                }
                (Slot::Wildcard(mut table), Slot::Wildcard(incoming)) => {
                    table.merge(incoming);
                    Slot::Wildcard(table)
                }
            };
            *slot = merged;
        }
        self.count += other.count;
        Ok(())
    }

    /// Count a matching line: bump the total and each wildcard's value.
    ///
    /// The sequence is verified before anything is updated, so a rejected
    /// line leaves the template untouched.
    pub fn absorb(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() != self.slots.len() {
            return Err(ClusterError::InvariantViolation {
                template_id: self.id,
                position: tokens.len().min(self.slots.len()),
                expected: format!("{} tokens", self.slots.len()),
                actual: format!("{} tokens", tokens.len()),
            });
        }

        if let Some((position, (slot, token))) = self
            .slots
            .iter()
            .zip(tokens)
            .enumerate()
            .find(|(_, (slot, token))| !slot.accepts(token))
        {
            let expected = match slot {
                Slot::Literal(value) => value.clone(),
                Slot::Wildcard(_) => WILDCARD_MARKER.to_string(),
            };
            return Err(ClusterError::InvariantViolation {
                template_id: self.id,
                position,
                expected,
                actual: (*token).to_string(),
            });
        }

        for (slot, token) in self.slots.iter_mut().zip(tokens) {
            if let Slot::Wildcard(table) = slot {
                table.add(token);
            }
        }
        self.count += 1;
        Ok(())
    }

    /// Render with wildcards replaced by the marker, e.g. `SSH * connect`
    pub fn event(&self) -> String {
        self.slots
            .iter()
            .map(|slot| match slot {
                Slot::Literal(value) => value.as_str(),
                Slot::Wildcard(_) => WILDCARD_MARKER,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Tokens of a matching line found at wildcard positions, in order
    pub fn extract_variables<'a>(&self, tokens: &[&'a str]) -> Vec<&'a str> {
        self.slots
            .iter()
            .zip(tokens)
            .filter(|(slot, _)| slot.is_wildcard())
            .map(|(_, token)| *token)
            .collect()
    }

    /// Every wildcard table totals the template count
    pub fn counts_conserved(&self) -> bool {
        self.slots.iter().all(|slot| match slot {
            Slot::Literal(_) => true,
            Slot::Wildcard(table) => table.total() == self.count,
        })
    }

    /// Immutable snapshot. A wildcard is flagged ambiguous when its normalized
    /// entropy lies in `(literal_threshold, wildcard_threshold]`.
    pub fn export(&self, literal_threshold: f64, wildcard_threshold: f64) -> TemplateRecord {
        TemplateRecord {
            template_id: self.id,
            length: self.slots.len(),
            count: self.count,
            slots: self
                .slots
                .iter()
                .map(|slot| match slot {
                    Slot::Literal(value) => SlotRecord::Literal {
                        value: value.clone(),
                    },
                    Slot::Wildcard(table) => {
                        let entropy = table.normalized_entropy();
                        SlotRecord::Wildcard {
                            values: table.to_sorted_map(),
                            entropy,
                            ambiguous: entropy > literal_threshold
                                && entropy <= wildcard_threshold,
                        }
                    }
                })
                .collect(),
        }
    }

    /// Re-enter the partition engine as one weighted member
    pub fn into_member(self) -> Member<'static> {
        Member::new(
            self.slots
                .into_iter()
                .map(|slot| match slot {
                    Slot::Literal(value) => Cell::Value(Cow::Owned(value)),
                    Slot::Wildcard(table) => Cell::Wildcard(table),
                })
                .collect(),
            self.count,
        )
    }
}

/// Exported view of one template position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotRecord {
    Literal {
        value: String,
    },
    Wildcard {
        values: BTreeMap<String, u64>,
        /// Normalized entropy of the value table at export time
        entropy: f64,
        ambiguous: bool,
    },
}

/// Immutable template snapshot for reporting or storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub template_id: TemplateId,
    pub length: usize,
    pub count: u64,
    pub slots: Vec<SlotRecord>,
}

impl TemplateRecord {
    pub fn event(&self) -> String {
        self.slots
            .iter()
            .map(|slot| match slot {
                SlotRecord::Literal { value } => value.as_str(),
                SlotRecord::Wildcard { .. } => WILDCARD_MARKER,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn literal(&self, position: usize) -> Option<&str> {
        match self.slots.get(position)? {
            SlotRecord::Literal { value } => Some(value),
            SlotRecord::Wildcard { .. } => None,
        }
    }

    pub fn wildcard_values(&self, position: usize) -> Option<&BTreeMap<String, u64>> {
        match self.slots.get(position)? {
            SlotRecord::Wildcard { values, .. } => Some(values),
            SlotRecord::Literal { .. } => None,
        }
    }

    /// Rebuild a live template, e.g. when reseeding from a stored snapshot
    pub fn into_template(self) -> Template {
        let slots = self
            .slots
            .into_iter()
            .map(|slot| match slot {
                SlotRecord::Literal { value } => Slot::Literal(value),
                SlotRecord::Wildcard { values, .. } => {
                    Slot::Wildcard(ValueHistogram::from_counts(values))
                }
            })
            .collect();
        Template::new(self.template_id, slots, self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh_template() -> Template {
        Template::new(
            1,
            vec![
                Slot::Literal("SSH".to_string()),
                Slot::Wildcard(ValueHistogram::from_counts([("user1", 1), ("user2", 1)])),
                Slot::Literal("connect".to_string()),
            ],
            2,
        )
    }

    #[test]
    fn test_matching() {
        let template = ssh_template();
        assert!(template.matches(&["SSH", "anyone", "connect"]));
        assert!(!template.matches(&["SSH", "anyone", "disconnect"]));
        assert!(!template.matches(&["SSH", "anyone"]));
    }

    #[test]
    fn test_absorb_updates_wildcards_only() {
        let mut template = ssh_template();
        template.absorb(&["SSH", "user3", "connect"]).unwrap();
        template.absorb(&["SSH", "user1", "connect"]).unwrap();

        assert_eq!(template.count(), 4);
        assert!(template.counts_conserved());
        match &template.slots()[1] {
            Slot::Wildcard(table) => {
                assert_eq!(table.get_count("user1"), 2);
                assert_eq!(table.get_count("user3"), 1);
            }
            other => panic!("expected wildcard, got {:?}", other),
        }
        assert_eq!(template.slots()[0], Slot::Literal("SSH".to_string()));
    }

    #[test]
    fn test_absorb_rejects_conflicting_literal() {
        let mut template = ssh_template();
        let before = template.clone();

        let err = template.absorb(&["SSH", "user1", "disconnect"]).unwrap_err();
        match err {
            ClusterError::InvariantViolation {
                template_id,
                position,
                expected,
                actual,
            } => {
                assert_eq!(template_id, 1);
                assert_eq!(position, 2);
                assert_eq!(expected, "connect");
                assert_eq!(actual, "disconnect");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(template, before);
    }

    #[test]
    fn test_absorb_rejects_wrong_length() {
        let mut template = ssh_template();
        assert!(template.absorb(&["SSH", "user1"]).is_err());
        assert_eq!(template.count(), 2);
    }

    #[test]
    fn test_seed_is_all_literal() {
        let template = Template::seed(9, &["a", "b"]);
        assert_eq!(template.count(), 1);
        assert_eq!(template.wildcard_positions().count(), 0);
        assert_eq!(template.event(), "a b");
    }

    #[test]
    fn test_event_and_variables() {
        let template = ssh_template();
        assert_eq!(template.event(), "SSH * connect");
        assert_eq!(
            template.extract_variables(&["SSH", "root", "connect"]),
            vec!["root"]
        );
    }

    #[test]
    fn test_shape_ignores_counts() {
        let mut other = ssh_template();
        other.absorb(&["SSH", "user9", "connect"]).unwrap();
        assert_eq!(ssh_template().shape(), other.shape());
        assert_eq!(
            ssh_template().shape(),
            vec![Some("SSH".to_string()), None, Some("connect".to_string())]
        );
        assert_ne!(
            ssh_template().shape(),
            Template::seed(2, &["SSH", "user1", "connect"]).shape()
        );
    }

    #[test]
    fn test_export_and_reimport() {
        let template = ssh_template();
        let record = template.export(0.75, 0.9);

        assert_eq!(record.template_id, 1);
        assert_eq!(record.length, 3);
        assert_eq!(record.count, 2);
        assert_eq!(record.literal(0), Some("SSH"));
        assert_eq!(record.literal(1), None);
        assert_eq!(record.event(), "SSH * connect");

        match &record.slots[1] {
            SlotRecord::Wildcard {
                values,
                entropy,
                ambiguous,
            } => {
                assert_eq!(values.get("user1"), Some(&1));
                assert!((entropy - 1.0).abs() < 1e-12);
                assert!(!ambiguous);
            }
            other => panic!("expected wildcard, got {:?}", other),
        }

        assert_eq!(record.clone().into_template(), template);
    }

    #[test]
    fn test_record_json_shape() {
        let record = ssh_template().export(0.75, 0.9);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["slots"][0]["kind"], "literal");
        assert_eq!(json["slots"][1]["kind"], "wildcard");
        assert_eq!(json["slots"][1]["values"]["user2"], 1);

        let back: TemplateRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_ambiguous_only_inside_band() {
        let skewed = Template::new(
            1,
            vec![Slot::Wildcard(ValueHistogram::from_counts([("a", 100), ("b", 1)]))],
            101,
        );
        match &skewed.export(0.75, 0.9).slots[0] {
            SlotRecord::Wildcard {
                entropy, ambiguous, ..
            } => {
                assert!(*entropy < 0.75);
                assert!(!ambiguous);
            }
            other => panic!("expected wildcard, got {:?}", other),
        }

        let mixed = Template::new(
            2,
            vec![Slot::Wildcard(ValueHistogram::from_counts([
                ("a", 1),
                ("b", 1),
                ("c", 1),
                ("d", 2),
            ]))],
            5,
        );
        match &mixed.export(0.75, 0.9).slots[0] {
            SlotRecord::Wildcard {
                entropy, ambiguous, ..
            } => {
                assert!(*entropy > 0.75 && *entropy <= 0.9);
                assert!(ambiguous);
            }
            other => panic!("expected wildcard, got {:?}", other),
        }
    }

    #[test]
    fn test_literal_mismatches_and_overlap() {
        let template = ssh_template();
        assert_eq!(template.literal_mismatches(&["SSH", "x", "connect"]), 0);
        assert_eq!(template.literal_mismatches(&["FTP", "x", "disconnect"]), 2);

        assert!(template.overlaps(&Template::seed(2, &["SSH", "user1", "connect"])));
        assert!(!template.overlaps(&Template::seed(3, &["SSH", "user1", "disconnect"])));
        assert!(!template.overlaps(&Template::seed(4, &["SSH", "connect"])));
    }

    #[test]
    fn test_generalize_widens_disagreeing_literals() {
        let mut template = Template::seed(1, &["SSH", "user1", "connect"]);
        template
            .generalize(Template::seed(2, &["SSH", "user2", "connect"]))
            .unwrap();
        assert_eq!(template, ssh_template());

        template.generalize(ssh_template()).unwrap();
        assert_eq!(template.count(), 4);
        assert!(template.counts_conserved());
        match &template.slots()[1] {
            Slot::Wildcard(table) => assert_eq!(table.get_count("user1"), 2),
            other => panic!("expected wildcard, got {:?}", other),
        }

        let mut short = Template::seed(3, &["a"]);
        assert!(short.generalize(Template::seed(4, &["a", "b"])).is_err());
        assert_eq!(short.count(), 1);
    }

    #[test]
    fn test_into_member_keeps_weight() {
        let member = ssh_template().into_member();
        assert_eq!(member.weight, 2);
        assert_eq!(member.cells[0].value(), Some("SSH"));
        assert_eq!(member.cells[1].value(), None);
    }
}
