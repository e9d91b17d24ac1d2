use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::models::{GovernmentUnitKind, GovernmentUnitLink};

/// Unit ids selected for a department, per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub units: BTreeMap<GovernmentUnitKind, BTreeSet<i64>>,
}

impl Selection {
    pub fn from_links(links: &[GovernmentUnitLink]) -> Self {
        let mut selection = Selection::default();
        for link in links {
            selection.insert(link.kind, link.unit_id);
        }
        selection
    }

    pub fn insert(&mut self, kind: GovernmentUnitKind, unit_id: i64) {
        self.units.entry(kind).or_default().insert(unit_id);
    }

    pub fn ids(&self, kind: GovernmentUnitKind) -> BTreeSet<i64> {
        self.units.get(&kind).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormError {
    pub field: String,
    pub value: String,
}

impl std::fmt::Display for FormError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} is not a valid id for {}", self.value, self.field)
    }
}

impl std::error::Error for FormError {}

/// Submitted editor form: repeated `counties=`, `reserves=`, ... fields plus
/// the `update_geom` flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditorSubmission {
    pub selection: Selection,
    pub update_geom: bool,
}

impl EditorSubmission {
    pub fn from_form(pairs: &[(String, String)]) -> Result<Self, FormError> {
        let mut submission = EditorSubmission::default();
        for (field, value) in pairs {
            if field == "update_geom" {
                submission.update_geom |= !value.is_empty();
                continue;
            }
            let Some(kind) = GovernmentUnitKind::from_form_field(field) else {
                continue;
            };
            let unit_id = value.trim().parse::<i64>().map_err(|_| FormError {
                field: field.clone(),
                value: value.clone(),
            })?;
            submission.selection.insert(kind, unit_id);
        }
        Ok(submission)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkChanges {
    pub connect: Vec<GovernmentUnitLink>,
    pub disconnect: Vec<GovernmentUnitLink>,
}

impl LinkChanges {
    pub fn is_empty(&self) -> bool {
        self.connect.is_empty() && self.disconnect.is_empty()
    }
}

/// Links to add and remove so a department's links match `submitted` for
/// one kind of unit.
pub fn reconcile(
    department_id: i64,
    kind: GovernmentUnitKind,
    current: &BTreeSet<i64>,
    submitted: &BTreeSet<i64>,
) -> LinkChanges {
    let link = |unit_id: &i64| GovernmentUnitLink {
        department_id,
        kind,
        unit_id: *unit_id,
    };
    LinkChanges {
        connect: submitted.difference(current).map(link).collect(),
        disconnect: current.difference(submitted).map(link).collect(),
    }
}

/// Reconciles every kind; kinds missing from the submission are cleared.
pub fn reconcile_all(department_id: i64, current: &Selection, submitted: &Selection) -> LinkChanges {
    let mut changes = LinkChanges::default();
    for kind in GovernmentUnitKind::ALL {
        let kind_changes = reconcile(department_id, kind, &current.ids(kind), &submitted.ids(kind));
        changes.connect.extend(kind_changes.connect);
        changes.disconnect.extend(kind_changes.disconnect);
    }
    changes
}

/// Applies `changes` to a set of links, as the in-memory store does.
#[cfg(test)]
pub fn apply_changes(links: &mut BTreeSet<GovernmentUnitLink>, changes: &LinkChanges) {
    for link in &changes.disconnect {
        links.remove(link);
    }
    for link in &changes.connect {
        links.insert(*link);
    }
}
