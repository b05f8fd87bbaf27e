//! Identity resolver
//!
//! All operations run on the caller's connection, normally the store or
//! merge transaction, so a failed resolution leaves nothing behind.
//!
//! Lookup rules:
//! - a persisted identifier is the *same* identifier when the value is equal
//!   and the issuers match (absent issuer = wildcard)
//! - hits on merged subjects are redirected along `merged_into`
//! - hits on more than one subject are a `NonUniqueSubject` conflict

use crate::db::{hierarchy, subjects};
use crate::db::subjects::SubjectAttributes;
use crate::error::{ArcError, ArcResult};
use crate::identity::{FuzzyStr, PersonName};
use crate::models::{Subject, SubjectId};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identity-related attributes of an incoming object
#[derive(Debug, Clone, Default)]
pub struct SubjectDemographics {
    /// Primary identifier first, then the "other identifiers"
    pub ids: Vec<SubjectId>,
    pub name: PersonName,
    pub birth_date: Option<String>,
    pub sex: Option<String>,
}

impl SubjectDemographics {
    pub fn new(ids: Vec<SubjectId>, name: PersonName) -> Self {
        Self {
            ids,
            name,
            ..Default::default()
        }
    }

    /// Identifiers with exact duplicates removed, order kept
    fn distinct_ids(&self) -> Vec<SubjectId> {
        let mut out: Vec<SubjectId> = Vec::with_capacity(self.ids.len());
        for id in &self.ids {
            if !id.value.is_empty() && !out.contains(id) {
                out.push(id.clone());
            }
        }
        out
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    fuzzy: Arc<dyn FuzzyStr>,
}

impl IdentityResolver {
    pub fn new(fuzzy: Arc<dyn FuzzyStr>) -> Self {
        Self { fuzzy }
    }

    pub fn fuzzy(&self) -> &dyn FuzzyStr {
        self.fuzzy.as_ref()
    }

    fn attributes(&self, demographics: &SubjectDemographics) -> SubjectAttributes {
        let name = &demographics.name;
        SubjectAttributes {
            name_alphabetic: name.alphabetic(),
            name_ideographic: name.ideographic.clone(),
            name_phonetic: name.phonetic.clone(),
            family_name_fuzzy: name.family.as_deref().map(|f| self.fuzzy.to_fuzzy(f)),
            given_name_fuzzy: name.given.as_deref().map(|g| self.fuzzy.to_fuzzy(g)),
            birth_date: demographics.birth_date.clone(),
            sex: demographics.sex.clone(),
        }
    }

    /// Surviving subject reached by following `merged_into` from `pk`
    pub async fn follow_merge_chain(
        &self,
        conn: &mut SqliteConnection,
        pk: i64,
    ) -> ArcResult<i64> {
        let mut visited = HashSet::new();
        let mut current = pk;
        loop {
            if !visited.insert(current) {
                return Err(ArcError::CircularMerge { subject: current });
            }
            match subjects::merged_into(conn, current).await? {
                Some(next) => current = next,
                None => return Ok(current),
            }
        }
    }

    /// Subjects (after merge redirection) owning any of the identifiers
    async fn matching_subjects(
        &self,
        conn: &mut SqliteConnection,
        ids: &[SubjectId],
    ) -> ArcResult<BTreeSet<i64>> {
        let mut found = BTreeSet::new();
        for id in ids {
            for stored in subjects::find_ids_by_value(conn, &id.value).await? {
                if stored.id.matches(id) {
                    found.insert(self.follow_merge_chain(conn, stored.subject_fk).await?);
                }
            }
        }
        Ok(found)
    }

    /// Resolve or create the subject for an incoming object
    pub async fn resolve(
        &self,
        conn: &mut SqliteConnection,
        demographics: &SubjectDemographics,
        now: DateTime<Utc>,
    ) -> ArcResult<Subject> {
        let ids = demographics.distinct_ids();
        let matches = self.matching_subjects(conn, &ids).await?;

        let matches: Vec<i64> = matches.into_iter().collect();
        let pk = match matches.as_slice() {
            [] => self.create(conn, demographics, &ids, now).await?,
            [pk] => {
                self.update_existing(conn, *pk, demographics, &ids, now).await?;
                *pk
            }
            found => {
                warn!(subjects = ?found, "Identifiers match more than one subject");
                return Err(ArcError::NonUniqueSubject {
                    subjects: found.to_vec(),
                });
            }
        };

        subjects::load_subject(conn, pk)
            .await?
            .ok_or_else(|| ArcError::NotFound(format!("subject {}", pk)))
    }

    async fn create(
        &self,
        conn: &mut SqliteConnection,
        demographics: &SubjectDemographics,
        ids: &[SubjectId],
        now: DateTime<Utc>,
    ) -> ArcResult<i64> {
        let pk = subjects::insert_subject(conn, &self.attributes(demographics), now).await?;
        for id in ids {
            subjects::insert_subject_id(conn, pk, id).await?;
        }
        info!(subject = pk, ids = ids.len(), "Created subject");
        Ok(pk)
    }

    /// Union identifiers into an existing subject; fill the name only if absent
    async fn update_existing(
        &self,
        conn: &mut SqliteConnection,
        pk: i64,
        demographics: &SubjectDemographics,
        ids: &[SubjectId],
        now: DateTime<Utc>,
    ) -> ArcResult<()> {
        self.union_ids(conn, pk, ids).await?;

        let subject = subjects::load_subject(conn, pk)
            .await?
            .ok_or_else(|| ArcError::NotFound(format!("subject {}", pk)))?;
        if !subject.has_name() && !demographics.name.is_wildcard() {
            subjects::update_subject_name(conn, pk, &self.attributes(demographics), now).await?;
            debug!(subject = pk, "Filled missing subject name");
        }
        Ok(())
    }

    /// Append new identifiers, widening the issuer of matching ones
    async fn union_ids(
        &self,
        conn: &mut SqliteConnection,
        pk: i64,
        ids: &[SubjectId],
    ) -> ArcResult<()> {
        let mut existing = subjects::ids_of_subject(conn, pk).await?;
        for id in ids {
            match existing.iter_mut().find(|stored| stored.id.matches(id)) {
                Some(stored) => {
                    if let Some(incoming) = &id.issuer {
                        let mut issuer = stored.id.issuer.clone().unwrap_or_default();
                        if issuer.merge_from(incoming) {
                            subjects::update_subject_id_issuer(conn, stored.pk, &issuer).await?;
                            debug!(subject = pk, id = %id.value, issuer = %issuer, "Upgraded issuer");
                            stored.id.issuer = Some(issuer);
                        }
                    }
                }
                None => {
                    let id_pk = subjects::insert_subject_id(conn, pk, id).await?;
                    existing.push(subjects::StoredSubjectId {
                        pk: id_pk,
                        subject_fk: pk,
                        id: id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Merge `loser` into `winner`
    ///
    /// Winner identifiers dominate: loser identifiers matching one of them
    /// are dropped, the rest are copied. Loser studies move to the winner.
    pub async fn merge(
        &self,
        conn: &mut SqliteConnection,
        loser: i64,
        winner: i64,
        now: DateTime<Utc>,
    ) -> ArcResult<Subject> {
        if loser == winner {
            return Err(ArcError::CircularMerge { subject: loser });
        }

        let loser_subject = subjects::load_subject(conn, loser)
            .await?
            .ok_or_else(|| ArcError::NotFound(format!("subject {}", loser)))?;
        if let Some(merged_into) = loser_subject.merged_into {
            return Err(ArcError::SubjectMerged {
                subject: loser,
                merged_into,
            });
        }
        if subjects::load_subject(conn, winner).await?.is_none() {
            return Err(ArcError::NotFound(format!("subject {}", winner)));
        }

        // Walk the winner's chain; reaching the loser would close a cycle
        let mut visited = HashSet::new();
        let mut target = winner;
        loop {
            if target == loser || !visited.insert(target) {
                return Err(ArcError::CircularMerge { subject: loser });
            }
            match subjects::merged_into(conn, target).await? {
                Some(next) => target = next,
                None => break,
            }
        }
        if target != winner {
            debug!(winner, surviving = target, "Winner already merged, using surviving subject");
        }

        let winner_ids = subjects::ids_of_subject(conn, target).await?;
        let mut copied = 0usize;
        for id in &loser_subject.ids {
            if winner_ids.iter().any(|w| w.id.matches(id)) {
                continue;
            }
            subjects::insert_subject_id(conn, target, id).await?;
            copied += 1;
        }

        let moved = hierarchy::move_studies(conn, loser, target, now).await?;
        subjects::mark_merged(conn, loser, target, now).await?;
        subjects::refresh_num_studies(conn, target, now).await?;

        info!(
            loser,
            winner = target,
            ids_copied = copied,
            studies_moved = moved,
            "Merged subject"
        );

        subjects::load_subject(conn, target)
            .await?
            .ok_or_else(|| ArcError::NotFound(format!("subject {}", target)))
    }

    /// Resolve both sides by identifiers, then merge
    pub async fn merge_by_identifiers(
        &self,
        conn: &mut SqliteConnection,
        loser: &SubjectDemographics,
        winner: &SubjectDemographics,
        now: DateTime<Utc>,
    ) -> ArcResult<Subject> {
        let winner_subject = self.resolve(conn, winner, now).await?;
        let loser_subject = self.resolve(conn, loser, now).await?;
        if loser_subject.pk == winner_subject.pk {
            debug!(subject = winner_subject.pk, "Both sides resolve to one subject, nothing to merge");
            return Ok(winner_subject);
        }
        self.merge(conn, loser_subject.pk, winner_subject.pk, now).await
    }
}
