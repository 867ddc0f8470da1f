use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub object_type: String,
    pub object_id: String,
}

impl ObjectRef {
    pub fn new(object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            object_id: object_id.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}

/// The holder side of a relationship: a concrete object, or with a relation
/// the set of subjects holding that relation on the object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectRef {
    pub subject_type: String,
    pub subject_id: String,
    pub subject_relation: Option<String>,
}

impl SubjectRef {
    pub fn direct(subject_type: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
            subject_relation: None,
        }
    }

    pub fn userset(
        subject_type: impl Into<String>,
        subject_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
            subject_relation: Some(relation.into()),
        }
    }

    pub fn object(&self) -> ObjectRef {
        ObjectRef::new(&self.subject_type, &self.subject_id)
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.subject_id)?;
        if let Some(ref rel) = self.subject_relation {
            write!(f, "#{rel}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tuple {
    pub object: ObjectRef,
    pub relation: String,
    pub subject: SubjectRef,
}

impl Tuple {
    pub fn new(object: ObjectRef, relation: impl Into<String>, subject: SubjectRef) -> Self {
        Self {
            object,
            relation: relation.into(),
            subject,
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.object, self.relation, self.subject)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid relationship '{input}': expected type:id#relation@type:id[#relation]")]
pub struct TupleParseError {
    pub input: String,
}

impl FromStr for SubjectRef {
    type Err = TupleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TupleParseError {
            input: s.to_string(),
        };
        let (subject_type, rest) = s.split_once(':').ok_or_else(invalid)?;
        let subject = match rest.split_once('#') {
            Some((id, rel)) => SubjectRef::userset(subject_type, id, rel),
            None => SubjectRef::direct(subject_type, rest),
        };
        if subject.subject_type.is_empty() {
            return Err(invalid());
        }
        Ok(subject)
    }
}

impl FromStr for Tuple {
    type Err = TupleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TupleParseError {
            input: s.to_string(),
        };
        let (resource, subject) = s.split_once('@').ok_or_else(invalid)?;
        let (object, relation) = resource.split_once('#').ok_or_else(invalid)?;
        let (object_type, object_id) = object.split_once(':').ok_or_else(invalid)?;
        if object_type.is_empty() || relation.is_empty() {
            return Err(invalid());
        }
        let subject = subject.parse().map_err(|_| invalid())?;
        Ok(Tuple::new(
            ObjectRef::new(object_type, object_id),
            relation,
            subject,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Insert the tuple; a no-op when it already exists.
    Create,
    /// Remove the tuple; a no-op when it does not exist.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipUpdate {
    pub operation: Operation,
    pub tuple: Tuple,
}

impl RelationshipUpdate {
    pub fn create(tuple: Tuple) -> Self {
        Self {
            operation: Operation::Create,
            tuple,
        }
    }

    pub fn delete(tuple: Tuple) -> Self {
        Self {
            operation: Operation::Delete,
            tuple,
        }
    }
}

/// Position in a scan of one `type#relation` ordered by `(object_id, subject)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    pub object_id: String,
    /// `None` positions the cursor after every tuple of `object_id`.
    pub subject: Option<SubjectRef>,
}

impl ScanCursor {
    pub fn after_tuple(tuple: &Tuple) -> Self {
        Self {
            object_id: tuple.object.object_id.clone(),
            subject: Some(tuple.subject.clone()),
        }
    }

    pub fn after_object(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            subject: None,
        }
    }

    /// Whether `tuple` sorts strictly after this position.
    pub fn precedes(&self, tuple: &Tuple) -> bool {
        match tuple.object.object_id.as_str().cmp(self.object_id.as_str()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.subject.as_ref().is_some_and(|s| &tuple.subject > s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleFilter {
    pub object_type: Option<String>,
    pub object_id: Option<String>,
    pub relation: Option<String>,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    pub subject_relation: Option<Option<String>>,
}

impl TupleFilter {
    pub fn matches(&self, tuple: &Tuple) -> bool {
        fn field(expected: &Option<String>, actual: &str) -> bool {
            expected.as_deref().is_none_or(|e| e == actual)
        }

        field(&self.object_type, &tuple.object.object_type)
            && field(&self.object_id, &tuple.object.object_id)
            && field(&self.relation, &tuple.relation)
            && field(&self.subject_type, &tuple.subject.subject_type)
            && field(&self.subject_id, &tuple.subject.subject_id)
            && self
                .subject_relation
                .as_ref()
                .is_none_or(|sr| sr == &tuple.subject.subject_relation)
    }
}

/// A point in the store's commit history. Every successful write advances it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(u64);

impl Revision {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(object_id: &str, user: &str) -> Tuple {
        Tuple::new(
            ObjectRef::new("thing", object_id),
            "reader",
            SubjectRef::direct("user", user),
        )
    }

    #[test]
    fn userset_subject_display() {
        let subject = SubjectRef::userset("group", "engineering", "user_member");

        assert_eq!(subject.to_string(), "group:engineering#user_member");
        assert_eq!(subject.object(), ObjectRef::new("group", "engineering"));
    }

    #[test]
    fn tuple_display_matches_canonical_form() {
        let tuple = Tuple::new(
            ObjectRef::new("thing", "thing-id-0"),
            "accesser",
            SubjectRef::userset("group", "eng", "user_member"),
        );

        assert_eq!(
            tuple.to_string(),
            "thing:thing-id-0#accesser@group:eng#user_member"
        );
    }

    #[test]
    fn tuple_parses_from_canonical_form() {
        let tuple: Tuple = "thing:t1#owner@administration:root#member".parse().unwrap();

        assert_eq!(tuple.object, ObjectRef::new("thing", "t1"));
        assert_eq!(tuple.relation, "owner");
        assert_eq!(
            tuple.subject,
            SubjectRef::userset("administration", "root", "member")
        );
    }

    #[test]
    fn malformed_tuples_are_rejected() {
        for input in ["thing:t1#owner", "thing:t1@user:u", "thing:t1#owner@user", ":t1#r@user:u"] {
            assert!(input.parse::<Tuple>().is_err(), "accepted: {input}");
        }
    }

    #[test]
    fn tuple_ordering_is_by_object_then_relation_then_subject() {
        let mut tuples = vec![reader("b", "alice"), reader("a", "zed"), reader("a", "bob")];

        tuples.sort();

        assert_eq!(
            tuples,
            vec![reader("a", "bob"), reader("a", "zed"), reader("b", "alice")]
        );
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(TupleFilter::default().matches(&reader("t1", "alice")));
    }

    #[test]
    fn filter_by_subject_relation_none_matches_direct_only() {
        let filter = TupleFilter {
            subject_relation: Some(None),
            ..Default::default()
        };
        let userset = Tuple::new(
            ObjectRef::new("thing", "t1"),
            "accesser",
            SubjectRef::userset("group", "eng", "user_member"),
        );

        assert!(filter.matches(&reader("t1", "alice")));
        assert!(!filter.matches(&userset));
    }

    #[test]
    fn filter_all_fields() {
        let filter = TupleFilter {
            object_type: Some("thing".to_string()),
            object_id: Some("t1".to_string()),
            relation: Some("reader".to_string()),
            subject_type: Some("user".to_string()),
            subject_id: Some("alice".to_string()),
            subject_relation: Some(None),
        };

        assert!(filter.matches(&reader("t1", "alice")));
        assert!(!filter.matches(&reader("t2", "alice")));
        assert!(!filter.matches(&reader("t1", "bob")));
    }

    #[test]
    fn scan_cursor_positions() {
        let after_bob = ScanCursor::after_tuple(&reader("a", "bob"));
        let after_a = ScanCursor::after_object("a");

        assert!(!after_bob.precedes(&reader("a", "bob")));
        assert!(after_bob.precedes(&reader("a", "carol")));
        assert!(!after_a.precedes(&reader("a", "zed")));
        assert!(after_a.precedes(&reader("b", "alice")));
    }

    #[test]
    fn revision_advances_monotonically() {
        let rev = Revision::default();

        assert_eq!(rev.value(), 0);
        assert!(rev.next() > rev);
        assert_eq!(rev.next().to_string(), "1");
    }
}
