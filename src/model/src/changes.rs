// Copyright 2024 Yuanrong Scheduler Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `ResourceUnitChange`/`ResourceUnitChanges` and the revision-range merge
//! algebra used to compact a revision range into one coherent diff.
//!
//! Design Note "Delta merging": this is a small commutative/associative
//! algebra over a closed variant, implemented as a tagged sum with an
//! inline fold — deliberately not built on a generic patch/diff crate.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::resource::{ResourceMap, ResourceUnit, UnitStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstanceChange {
    Add { id: String, resources: ResourceMap },
    Delete { id: String },
}

impl InstanceChange {
    fn id(&self) -> &str {
        match self {
            InstanceChange::Add { id, .. } => id,
            InstanceChange::Delete { id } => id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Modification {
    pub status_change: Option<UnitStatus>,
    pub instance_changes: Vec<InstanceChange>,
}

impl Modification {
    pub fn is_empty(&self) -> bool {
        self.status_change.is_none() && self.instance_changes.is_empty()
    }

    /// `Modify + Modify -> Modify(merged)`: later status wins; `Add/Delete
    /// instance_k` pairs across the two modifications cancel.
    fn merge(self, other: Modification) -> Modification {
        let status_change = other.status_change.or(self.status_change);
        let mut by_id: IndexMap<String, InstanceChange> = IndexMap::new();
        for change in self.instance_changes.into_iter().chain(other.instance_changes) {
            match by_id.shift_remove(change.id()) {
                Some(prev) if cancels(&prev, &change) => {}
                Some(_) | None => {
                    by_id.insert(change.id().to_string(), change);
                }
            }
        }
        Modification {
            status_change,
            instance_changes: by_id.into_values().collect(),
        }
    }
}

fn cancels(a: &InstanceChange, b: &InstanceChange) -> bool {
    matches!(
        (a, b),
        (InstanceChange::Add { .. }, InstanceChange::Delete { .. })
            | (InstanceChange::Delete { .. }, InstanceChange::Add { .. })
    )
}

/// Apply a `Modification` onto a freshly-added unit, used by the
/// `Add + Modify -> Add(updated)` merge rule.
fn apply_modification_to_unit(mut unit: ResourceUnit, modification: &Modification) -> ResourceUnit {
    if let Some(status) = modification.status_change {
        unit.status = status;
    }
    for change in &modification.instance_changes {
        match change {
            InstanceChange::Add { id, resources } => {
                unit.instances.insert(
                    id.clone(),
                    crate::resource::InstanceInfo {
                        id: id.clone(),
                        resources: resources.clone(),
                        labels: Default::default(),
                        unit_id: unit.id.clone(),
                        target: crate::resource::TargetKind::Instance,
                    },
                );
            }
            InstanceChange::Delete { id } => {
                unit.instances.remove(id);
            }
        }
    }
    unit
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResourceUnitChange {
    Addition { resource_unit: Box<ResourceUnit> },
    Deletion { resource_unit_id: String },
    Modification {
        resource_unit_id: String,
        modification: Modification,
    },
}

impl ResourceUnitChange {
    pub fn unit_id(&self) -> &str {
        match self {
            ResourceUnitChange::Addition { resource_unit } => &resource_unit.id,
            ResourceUnitChange::Deletion { resource_unit_id } => resource_unit_id,
            ResourceUnitChange::Modification { resource_unit_id, .. } => resource_unit_id,
        }
    }
}

/// One revision range's worth of changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUnitChanges {
    pub start_revision: u64,
    pub end_revision: u64,
    pub local_id: String,
    pub local_view_init_time: u64,
    pub changes: Vec<ResourceUnitChange>,
}

impl ResourceUnitChanges {
    pub fn empty(local_id: impl Into<String>, revision: u64, view_init_time: u64) -> Self {
        Self {
            start_revision: revision,
            end_revision: revision,
            local_id: local_id.into(),
            local_view_init_time: view_init_time,
            changes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start_revision == self.end_revision && self.changes.is_empty()
    }
}

/// `PullResource` request: what the caller last saw, so the responder can
/// tell whether an incremental diff is still valid or a full resync is
/// required.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PullResourceRequest {
    /// Revision the caller last applied.
    pub version: u64,
    /// `viewInitTime` the caller's copy was built from; a mismatch against
    /// the responder's current `viewInitTime` means the changelog the
    /// caller is anchored to no longer exists and only a full snapshot can
    /// bring it current.
    pub local_view_init_time: u64,
}

/// Merge a list of raw per-revision changes (already filtered to the
/// `(start, end]` range, in arrival order) using the fold rules above.
/// Output is ordered by first appearance of `resourceUnitId`, per 
pub fn merge_changes(changes: impl IntoIterator<Item = ResourceUnitChange>) -> Vec<ResourceUnitChange> {
    let mut folded: IndexMap<String, ResourceUnitChange> = IndexMap::new();

    for change in changes {
        let id = change.unit_id().to_string();
        match folded.shift_remove(&id) {
            None => {
                folded.insert(id, change);
            }
            Some(acc) => {
                if let Some(merged) = fold_pair(acc, change) {
                    folded.insert(id, merged);
                }
                // `None` means the pair canceled (`Add + Delete -> empty`);
                // leave the id absent from the map.
            }
        }
    }

    folded
        .into_values()
        .filter(|c| match c {
            ResourceUnitChange::Modification { modification, .. } => !modification.is_empty(),
            _ => true,
        })
        .collect()
}

fn fold_pair(acc: ResourceUnitChange, next: ResourceUnitChange) -> Option<ResourceUnitChange> {
    use ResourceUnitChange::*;
    match (acc, next) {
        (Addition { resource_unit }, Modification { modification, .. }) => Some(Addition {
            resource_unit: Box::new(apply_modification_to_unit(*resource_unit, &modification)),
        }),
        (Addition { .. }, Deletion { .. }) => None,
        (Modification { resource_unit_id, .. }, Deletion { .. }) => {
            Some(Deletion { resource_unit_id })
        }
        (
            Modification {
                resource_unit_id,
                modification: m1,
            },
            Modification { modification: m2, .. },
        ) => Some(Modification {
            resource_unit_id,
            modification: m1.merge(m2),
        }),
        // Re-addition after a deletion within the same range: treat as a
        // fresh add (the view never emits this combination itself, but a
        // downstream consumer folding an externally supplied stream might).
        (Deletion { .. }, Addition { resource_unit }) => Some(Addition { resource_unit }),
        (Deletion { resource_unit_id }, Modification { .. }) => {
            tracing::warn!(resource_unit_id, "modification after deletion in same range, ignoring");
            Some(Deletion { resource_unit_id })
        }
        (acc @ Addition { .. }, Addition { .. }) => {
            tracing::warn!("duplicate addition in same range, keeping the first");
            Some(acc)
        }
        (Deletion { resource_unit_id }, Deletion { .. }) => Some(Deletion { resource_unit_id }),
        (Modification { .. }, Addition { resource_unit }) => {
            tracing::warn!(id = %resource_unit.id, "addition after modification in same range, replacing");
            Some(Addition { resource_unit })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceUnit;

    fn unit(id: &str) -> ResourceUnit {
        ResourceUnit::leaf(id, "owner", ResourceMap::new())
    }

    #[test]
    fn add_then_modify_folds_to_updated_add() {
        let changes = vec![
            ResourceUnitChange::Addition {
                resource_unit: Box::new(unit("u1")),
            },
            ResourceUnitChange::Modification {
                resource_unit_id: "u1".into(),
                modification: Modification {
                    status_change: Some(UnitStatus::Recovering),
                    instance_changes: vec![],
                },
            },
        ];
        let merged = merge_changes(changes);
        assert_eq!(merged.len(), 1);
        match &merged[0] {
            ResourceUnitChange::Addition { resource_unit } => {
                assert_eq!(resource_unit.status, UnitStatus::Recovering);
            }
            other => panic!("expected Addition, got {other:?}"),
        }
    }

    #[test]
    fn add_then_delete_cancels() {
        let changes = vec![
            ResourceUnitChange::Addition {
                resource_unit: Box::new(unit("u1")),
            },
            ResourceUnitChange::Deletion {
                resource_unit_id: "u1".into(),
            },
        ];
        assert!(merge_changes(changes).is_empty());
    }

    #[test]
    fn modify_then_delete_folds_to_delete() {
        let changes = vec![
            ResourceUnitChange::Modification {
                resource_unit_id: "u1".into(),
                modification: Modification {
                    status_change: Some(UnitStatus::Recovering),
                    instance_changes: vec![],
                },
            },
            ResourceUnitChange::Deletion {
                resource_unit_id: "u1".into(),
            },
        ];
        let merged = merge_changes(changes);
        assert_eq!(merged.len(), 1);
        assert!(matches!(merged[0], ResourceUnitChange::Deletion { .. }));
    }

    #[test]
    fn modify_then_modify_merges_and_cancels_instance_pairs() {
        let changes = vec![
            ResourceUnitChange::Modification {
                resource_unit_id: "u1".into(),
                modification: Modification {
                    status_change: Some(UnitStatus::Recovering),
                    instance_changes: vec![InstanceChange::Add {
                        id: "i1".into(),
                        resources: ResourceMap::new(),
                    }],
                },
            },
            ResourceUnitChange::Modification {
                resource_unit_id: "u1".into(),
                modification: Modification {
                    status_change: Some(UnitStatus::Normal),
                    instance_changes: vec![InstanceChange::Delete { id: "i1".into() }],
                },
            },
        ];
        let merged = merge_changes(changes);
        assert_eq!(merged.len(), 1);
        match &merged[0] {
            ResourceUnitChange::Modification {
                modification, ..
            } => {
                assert_eq!(modification.status_change, Some(UnitStatus::Normal));
                assert!(modification.instance_changes.is_empty());
            }
            other => panic!("expected Modification, got {other:?}"),
        }
    }

    #[test]
    fn output_ordered_by_first_appearance() {
        let changes = vec![
            ResourceUnitChange::Addition {
                resource_unit: Box::new(unit("b")),
            },
            ResourceUnitChange::Addition {
                resource_unit: Box::new(unit("a")),
            },
            ResourceUnitChange::Modification {
                resource_unit_id: "b".into(),
                modification: Modification {
                    status_change: Some(UnitStatus::Recovering),
                    instance_changes: vec![],
                },
            },
        ];
        let merged = merge_changes(changes);
        let ids: Vec<&str> = merged.iter().map(|c| c.unit_id()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
