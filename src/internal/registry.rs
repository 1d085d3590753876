use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::internal::data_types::{Participant, ParticipantId};

/// discrete grid layout class, a pure function of the participant count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutBucket {
    #[display(fmt = "solo")]
    Solo,
    #[display(fmt = "pair")]
    Pair,
    #[display(fmt = "triple")]
    Triple,
    #[display(fmt = "quad")]
    Quad,
    #[display(fmt = "five")]
    Five,
    #[display(fmt = "grid-max")]
    GridMax,
}

impl LayoutBucket {
    pub fn for_count(count: usize) -> Self {
        match count {
            0 | 1 => LayoutBucket::Solo,
            2 => LayoutBucket::Pair,
            3 => LayoutBucket::Triple,
            4 => LayoutBucket::Quad,
            5 => LayoutBucket::Five,
            _ => LayoutBucket::GridMax,
        }
    }
}

/// live participant list of the current call.
/// the local participant is kept apart so it always sorts first
pub struct ParticipantRegistry {
    local: Option<Participant>,
    /// join order
    remotes: Vec<Participant>,
    layout: LayoutBucket,
    /// participant count the layout was last computed for
    laid_out_count: usize,
}

impl Default for ParticipantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self {
            local: None,
            remotes: Vec::new(),
            layout: LayoutBucket::Solo,
            laid_out_count: 0,
        }
    }

    /// returns false if the participant was already present. a repeated join
    /// refreshes display metadata but keeps the original position
    pub fn add(&mut self, participant: Participant) -> bool {
        if participant.is_local {
            let inserted = self.local.is_none();
            if let Some(existing) = &self.local {
                if existing.id != participant.id {
                    log::warn!(
                        "replacing local participant {} with {}",
                        existing.id,
                        participant.id
                    );
                }
            }
            self.local = Some(participant);
            return inserted;
        }

        if let Some(existing) = self.remotes.iter_mut().find(|p| p.id == participant.id) {
            existing.display_name = participant.display_name;
            existing.avatar_url = participant.avatar_url;
            return false;
        }
        self.remotes.push(participant);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Participant> {
        if self.local.as_ref().map(|p| p.id == id).unwrap_or(false) {
            return self.local.take();
        }
        let idx = self.remotes.iter().position(|p| p.id == id)?;
        Some(self.remotes.remove(idx))
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// local first, then remotes in join order
    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.local.iter().chain(self.remotes.iter())
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        self.iter().map(|p| p.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.remotes.len() + usize::from(self.local.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn layout(&self) -> LayoutBucket {
        self.layout
    }

    /// recomputes the layout if the participant count moved since the last call.
    /// returns the new bucket only when it differs from the previous one
    pub fn layout_update(&mut self) -> Option<LayoutBucket> {
        let count = self.len();
        if count == self.laid_out_count {
            return None;
        }
        self.laid_out_count = count;
        let bucket = LayoutBucket::for_count(count);
        if bucket == self.layout {
            return None;
        }
        self.layout = bucket;
        Some(bucket)
    }

    pub fn clear(&mut self) {
        self.local = None;
        self.remotes.clear();
        self.layout = LayoutBucket::Solo;
        self.laid_out_count = 0;
    }
}
