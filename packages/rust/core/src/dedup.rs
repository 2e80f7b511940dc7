//! Discovery deduplication.
//!
//! Organization enrichment can surface people linked to the organization.
//! Before those people are enriched, anyone already known to the run is
//! dropped. There is exactly one discovery round per transaction.

use std::collections::HashSet;

use amlflow_shared::{EntityKey, ExtractedEntities, Person};

/// Tracks the entity keys a run has already seen.
#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    known: HashSet<EntityKey>,
}

impl Deduplicator {
    pub fn new(known: impl IntoIterator<Item = EntityKey>) -> Self {
        Self {
            known: known.into_iter().filter(|k| !k.is_empty()).collect(),
        }
    }

    /// Seed with every originally extracted entity, organizations and people alike.
    pub fn from_extraction(entities: &ExtractedEntities) -> Self {
        Self::new(entities.keys())
    }

    pub fn is_known(&self, key: &EntityKey) -> bool {
        self.known.contains(key)
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    /// Discovered people not yet known, first occurrence kept, in input order.
    ///
    /// Pure: the known set is not updated, so calling it twice yields the
    /// same output.
    pub fn delta<'a>(&self, discovered: impl IntoIterator<Item = &'a Person>) -> Vec<Person> {
        let mut seen: HashSet<EntityKey> = HashSet::new();
        discovered
            .into_iter()
            .filter(|person| {
                let key = EntityKey::from_name(&person.name);
                !key.is_empty() && !self.known.contains(&key) && seen.insert(key)
            })
            .cloned()
            .collect()
    }

    /// Mark `people` as processed.
    pub fn absorb(&mut self, people: &[Person]) {
        self.known
            .extend(people.iter().map(|p| EntityKey::from_name(&p.name)).filter(|k| !k.is_empty()));
    }

    /// Compute the delta and mark it processed.
    pub fn next_round<'a>(&mut self, discovered: impl IntoIterator<Item = &'a Person>) -> Vec<Person> {
        let delta = self.delta(discovered);
        self.absorb(&delta);
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amlflow_shared::Organization;

    fn person(name: &str, connection: &str) -> Person {
        Person {
            name: name.into(),
            role: "director".into(),
            source: Some("wikidata".into()),
            entity_connection: Some(connection.into()),
            ..Default::default()
        }
    }

    fn extraction() -> ExtractedEntities {
        ExtractedEntities {
            organizations: vec![Organization {
                name: "Acme Shell Ltd".into(),
                ..Default::default()
            }],
            people: vec![Person {
                name: "Jane PEP".into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn drops_known_and_repeated_keys() {
        let dedup = Deduplicator::from_extraction(&extraction());
        let discovered = vec![
            person("JANE  pep", "Acme Shell Ltd"),
            person("John Founder", "Acme Shell Ltd"),
            person("john founder", "Other Corp"),
            person("   ", "Acme Shell Ltd"),
            person("Mary CEO", "Other Corp"),
        ];

        let delta = dedup.delta(&discovered);
        let names: Vec<&str> = delta.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["John Founder", "Mary CEO"]);
        // First occurrence wins, connection included.
        assert_eq!(delta[0].entity_connection.as_deref(), Some("Acme Shell Ltd"));
    }

    #[test]
    fn delta_is_repeatable_without_absorbing() {
        let dedup = Deduplicator::from_extraction(&extraction());
        let discovered = vec![person("John Founder", "Acme"), person("Mary CEO", "Acme")];
        assert_eq!(dedup.delta(&discovered), dedup.delta(&discovered));
    }

    #[test]
    fn nothing_new_once_absorbed() {
        let mut dedup = Deduplicator::from_extraction(&extraction());
        let discovered = vec![person("John Founder", "Acme"), person("Mary CEO", "Acme")];

        assert_eq!(dedup.next_round(&discovered).len(), 2);
        assert_eq!(dedup.known_count(), 4);
        assert!(dedup.next_round(&discovered).is_empty());
        assert!(dedup.is_known(&EntityKey::from_name("mary ceo")));
    }

    #[test]
    fn organizations_count_as_known() {
        // A person sharing an organization's name is not re-enriched.
        let dedup = Deduplicator::from_extraction(&extraction());
        assert!(dedup.delta(&[person("acme shell ltd", "x")]).is_empty());
    }
}
