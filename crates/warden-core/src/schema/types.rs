#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub types: Vec<TypeDefinition>,
}

impl Schema {
    pub fn get_type(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.iter().find(|t| t.name == name)
    }
}

/// What a bare name inside a permission expression refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Relation,
    Permission,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDefinition {
    pub name: String,
    pub relations: Vec<RelationDef>,
    pub permissions: Vec<PermissionDef>,
}

impl TypeDefinition {
    pub fn get_relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn get_permission(&self, name: &str) -> Option<&PermissionDef> {
        self.permissions.iter().find(|p| p.name == name)
    }

    pub fn resolve(&self, name: &str) -> Option<NameKind> {
        if self.get_relation(name).is_some() {
            Some(NameKind::Relation)
        } else if self.get_permission(name).is_some() {
            Some(NameKind::Permission)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    pub name: String,
    pub subject_types: Vec<SubjectTypeRef>,
}

impl RelationDef {
    pub fn allows(&self, subject_type: &str, subject_relation: Option<&str>) -> bool {
        self.subject_types
            .iter()
            .any(|st| st.type_name == subject_type && st.relation.as_deref() == subject_relation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectTypeRef {
    pub type_name: String,
    pub relation: Option<String>,
}

impl SubjectTypeRef {
    pub fn direct(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            relation: None,
        }
    }

    pub fn userset(type_name: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            relation: Some(relation.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDef {
    pub name: String,
    pub rule: RewriteRule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteRule {
    /// A relation or permission defined on the same type.
    This(String),
    Union(Vec<RewriteRule>),
    Intersection(Vec<RewriteRule>),
    Exclusion(Box<RewriteRule>, Box<RewriteRule>),
    /// `tupleset->target`: walk the tupleset relation, evaluate target on each subject.
    Arrow(String, String),
}

impl RewriteRule {
    /// Visits every node of the expression tree, parents before children.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a RewriteRule)) {
        visit(self);
        match self {
            RewriteRule::This(_) | RewriteRule::Arrow(_, _) => {}
            RewriteRule::Union(children) | RewriteRule::Intersection(children) => {
                for child in children {
                    child.walk(visit);
                }
            }
            RewriteRule::Exclusion(base, excluded) => {
                base.walk(visit);
                excluded.walk(visit);
            }
        }
    }

    /// Nesting depth of the expression; a leaf has depth 1.
    pub fn depth(&self) -> usize {
        match self {
            RewriteRule::This(_) | RewriteRule::Arrow(_, _) => 1,
            RewriteRule::Union(children) | RewriteRule::Intersection(children) => {
                1 + children.iter().map(RewriteRule::depth).max().unwrap_or(0)
            }
            RewriteRule::Exclusion(base, excluded) => 1 + base.depth().max(excluded.depth()),
        }
    }
}
