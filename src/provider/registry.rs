//! Provider catalog (spec §4.6 / §5: "Provider catalog is immutable after
//! construction"). The registry hands the invocation controller a
//! deterministic candidate order: the preferred provider first, then the
//! remaining same-modality providers in the catalog's stable sort order.

use std::sync::Arc;

use crate::provider::Modality;

/// One entry in the provider catalog.
#[derive(Clone)]
pub struct ProviderEntry {
    pub provider_id: String,
    pub modality: Modality,
    pub adapter: Arc<dyn super::invocation::Adapter>,
    /// Stable catalog rank used to break ties when no preferred provider is
    /// specified; lower sorts first.
    pub catalog_rank: u32,
}

/// Immutable, constructed-once catalog of provider adapters.
#[derive(Clone)]
pub struct ProviderRegistry {
    entries: Arc<Vec<ProviderEntry>>,
}

impl ProviderRegistry {
    pub fn new(mut entries: Vec<ProviderEntry>) -> Self {
        entries.sort_by(|a, b| a.catalog_rank.cmp(&b.catalog_rank).then_with(|| a.provider_id.cmp(&b.provider_id)));
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Deterministic candidate list for `modality`: `preferred` first (if
    /// present in the catalog for this modality), then the remaining
    /// providers in catalog order, capped at `max_candidates`.
    pub fn candidates(
        &self,
        modality: Modality,
        preferred: Option<&str>,
        max_candidates: usize,
    ) -> Vec<ProviderEntry> {
        let mut ordered: Vec<ProviderEntry> = Vec::new();
        if let Some(preferred_id) = preferred {
            if let Some(entry) = self
                .entries
                .iter()
                .find(|e| e.modality == modality && e.provider_id == preferred_id)
            {
                ordered.push(entry.clone());
            }
        }
        for entry in self.entries.iter() {
            if entry.modality != modality {
                continue;
            }
            if ordered.iter().any(|o| o.provider_id == entry.provider_id) {
                continue;
            }
            ordered.push(entry.clone());
        }
        ordered.truncate(max_candidates);
        ordered
    }
}
