use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::UnmatchedPolicy;
use crate::error::Result;
use crate::partition::{Member, PartitionEngine};
use crate::template::{Template, TemplateId, TemplateShape};

/// Hands out template ids in discovery order
#[derive(Debug)]
pub struct IdAllocator {
    next_template_id: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_template_id: AtomicU64::new(1), // Start from 1
        }
    }

    pub fn next_id(&self) -> TemplateId {
        self.next_template_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure future ids are strictly greater than `id`
    pub fn reserve_through(&self, id: TemplateId) {
        self.next_template_id
            .fetch_max(id.saturating_add(1), Ordering::SeqCst);
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// What ingesting one line did to the template set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterUpdateEvent {
    /// Counted into an existing template
    Absorbed {
        length: usize,
        template_id: TemplateId,
    },
    /// A new template was opened for the line
    NewTemplate {
        length: usize,
        template_id: TemplateId,
    },
    /// An existing template was widened in place to cover the line
    Widened {
        length: usize,
        template_id: TemplateId,
    },
    /// The bucket was re-partitioned; the line ended up in `template_id`
    Repartitioned {
        length: usize,
        template_id: TemplateId,
        templates_before: usize,
        templates_after: usize,
    },
    /// The line had no tokens
    Skipped,
}

impl ClusterUpdateEvent {
    pub fn template_id(&self) -> Option<TemplateId> {
        match self {
            ClusterUpdateEvent::Absorbed { template_id, .. }
            | ClusterUpdateEvent::NewTemplate { template_id, .. }
            | ClusterUpdateEvent::Widened { template_id, .. }
            | ClusterUpdateEvent::Repartitioned { template_id, .. } => Some(*template_id),
            ClusterUpdateEvent::Skipped => None,
        }
    }
}

/// Result of a read-only lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    pub template_id: Option<TemplateId>,
    pub event: Option<String>,
    /// Tokens at the template's wildcard positions, in order
    pub variables: Vec<String>,
}

impl MatchResult {
    pub fn unmatched() -> Self {
        Self {
            matched: false,
            template_id: None,
            event: None,
            variables: Vec::new(),
        }
    }
}

/// Template counts before and after a re-partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepartitionSummary {
    pub templates_before: usize,
    pub templates_after: usize,
}

/// All templates sharing one token count.
///
/// Templates are kept in id order and are pairwise disjoint: no sequence
/// matches two of them.
#[derive(Debug, Clone)]
pub struct LengthBucket {
    length: usize,
    templates: Vec<Template>,
}

impl LengthBucket {
    pub fn new(length: usize) -> Self {
        Self {
            length,
            templates: Vec::new(),
        }
    }

    /// Bucket holding previously discovered templates
    pub fn with_templates(length: usize, mut templates: Vec<Template>) -> Self {
        debug_assert!(templates.iter().all(|t| t.len() == length));
        templates.sort_by_key(Template::id);
        Self { length, templates }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    /// Lines represented by the bucket
    pub fn line_count(&self) -> u64 {
        self.templates.iter().map(Template::count).sum()
    }

    pub fn find(&self, tokens: &[&str]) -> Option<&Template> {
        self.templates.iter().find(|t| t.matches(tokens))
    }

    fn position(&self, tokens: &[&str]) -> Option<usize> {
        self.templates.iter().position(|t| t.matches(tokens))
    }

    /// Absorb the sequence into its template, or handle it as unmatched per `policy`
    pub fn route(
        &mut self,
        tokens: &[&str],
        policy: UnmatchedPolicy,
        engine: &PartitionEngine,
        ids: &IdAllocator,
    ) -> ClusterUpdateEvent {
        debug_assert_eq!(tokens.len(), self.length);

        if self.templates.is_empty() {
            self.repartition(vec![Member::from_tokens(tokens)], engine, ids);
            let template_id = self.template_id_for(tokens);
            tracing::debug!(
                "Opened bucket of length {} with template {}",
                self.length,
                template_id
            );
            return ClusterUpdateEvent::NewTemplate {
                length: self.length,
                template_id,
            };
        }

        if let Some(index) = self.position(tokens) {
            let template = &mut self.templates[index];
            match template.absorb(tokens) {
                Ok(()) => {
                    return ClusterUpdateEvent::Absorbed {
                        length: self.length,
                        template_id: template.id(),
                    };
                }
                Err(e) => {
                    debug_assert!(false, "matching template refused the line: {}", e);
                    tracing::warn!("{}; forcing re-partition of bucket {}", e, self.length);
                    return self.repartition_with(tokens, engine, ids);
                }
            }
        }

        match policy {
            UnmatchedPolicy::SeedNew => match self.closest_coalescing(tokens, engine) {
                Some(index) => match self.widen(index, tokens) {
                    Ok(Some(event)) => event,
                    // Widening would overlap a neighbour
                    Ok(None) => self.repartition_with(tokens, engine, ids),
                    Err(e) => {
                        debug_assert!(false, "widening failed: {}", e);
                        tracing::warn!("{}; forcing re-partition of bucket {}", e, self.length);
                        self.repartition_with(tokens, engine, ids)
                    }
                },
                None => self.seed(tokens, ids),
            },
            UnmatchedPolicy::Repartition => self.repartition_with(tokens, engine, ids),
        }
    }

    /// Template with the fewest literal mismatches among those whose literals
    /// would not survive one conflicting line. Ties go to the lowest id.
    fn closest_coalescing(&self, tokens: &[&str], engine: &PartitionEngine) -> Option<usize> {
        self.templates
            .iter()
            .enumerate()
            .filter(|(_, t)| engine.coalesces(t.count()))
            .min_by_key(|(_, t)| t.literal_mismatches(tokens))
            .map(|(index, _)| index)
    }

    /// Generalize the template at `index` to cover the line. Returns `None`
    /// and leaves the bucket untouched when the widened template would overlap
    /// another one.
    fn widen(&mut self, index: usize, tokens: &[&str]) -> Result<Option<ClusterUpdateEvent>> {
        let template_id = self.templates[index].id();
        let mut widened = self.templates[index].clone();
        widened.generalize(Template::seed(template_id, tokens))?;

        if self
            .templates
            .iter()
            .enumerate()
            .any(|(i, t)| i != index && t.overlaps(&widened))
        {
            return Ok(None);
        }

        tracing::debug!(
            "Widened template {} in bucket of length {} to {}",
            template_id,
            self.length,
            widened.event()
        );
        self.templates[index] = widened;
        Ok(Some(ClusterUpdateEvent::Widened {
            length: self.length,
            template_id,
        }))
    }

    fn seed(&mut self, tokens: &[&str], ids: &IdAllocator) -> ClusterUpdateEvent {
        let template = Template::seed(ids.next_id(), tokens);
        let template_id = template.id();
        self.templates.push(template);
        tracing::debug!(
            "Seeded template {} in bucket of length {}",
            template_id,
            self.length
        );
        ClusterUpdateEvent::NewTemplate {
            length: self.length,
            template_id,
        }
    }

    fn repartition_with(
        &mut self,
        tokens: &[&str],
        engine: &PartitionEngine,
        ids: &IdAllocator,
    ) -> ClusterUpdateEvent {
        let summary = self.repartition(vec![Member::from_tokens(tokens)], engine, ids);
        ClusterUpdateEvent::Repartitioned {
            length: self.length,
            template_id: self.template_id_for(tokens),
            templates_before: summary.templates_before,
            templates_after: summary.templates_after,
        }
    }

    /// Id of the template a just-routed sequence landed in; 0 is never assigned
    fn template_id_for(&self, tokens: &[&str]) -> TemplateId {
        let template = self.find(tokens);
        debug_assert!(template.is_some(), "re-partition lost a routed sequence");
        template.map_or(0, Template::id)
    }

    /// Rebuild the bucket's templates from their aggregated counts plus `extra` lines.
    ///
    /// A resulting template with the same literal/wildcard layout as a previous
    /// one keeps that template's id; anything else gets a fresh id.
    pub fn repartition(
        &mut self,
        extra: Vec<Member<'_>>,
        engine: &PartitionEngine,
        ids: &IdAllocator,
    ) -> RepartitionSummary {
        let previous = std::mem::take(&mut self.templates);
        let templates_before = previous.len();

        let mut reusable: Vec<Option<(TemplateId, TemplateShape)>> = previous
            .iter()
            .map(|t| Some((t.id(), t.shape())))
            .collect();

        let mut members: Vec<Member<'_>> = previous.into_iter().map(Template::into_member).collect();
        members.extend(extra);

        let mut templates: Vec<Template> = engine
            .partition(members, self.length)
            .into_iter()
            .map(|cluster| {
                let mut template = cluster.into_template(0);
                let shape = template.shape();
                let reused = reusable
                    .iter_mut()
                    .find(|slot| slot.as_ref().map_or(false, |(_, old)| *old == shape))
                    .and_then(Option::take)
                    .map(|(id, _)| id);
                template.set_id(reused.unwrap_or_else(|| ids.next_id()));
                template
            })
            .collect();
        templates.sort_by_key(Template::id);

        let summary = RepartitionSummary {
            templates_before,
            templates_after: templates.len(),
        };
        tracing::debug!(
            "Re-partitioned bucket of length {}: {} -> {} templates",
            self.length,
            summary.templates_before,
            summary.templates_after
        );

        self.templates = templates;
        summary
    }

    /// Re-partition from aggregated state alone, coalescing seeded singletons
    pub fn consolidate(&mut self, engine: &PartitionEngine, ids: &IdAllocator) -> RepartitionSummary {
        self.repartition(Vec::new(), engine, ids)
    }
}
