use std::fmt::{self, Write};

use super::types::{RewriteRule, Schema, SubjectTypeRef};

impl fmt::Display for SubjectTypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(rel) => write!(f, "{}#{rel}", self.type_name),
            None => f.write_str(&self.type_name),
        }
    }
}

impl fmt::Display for RewriteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteRule::This(name) => f.write_str(name),
            RewriteRule::Arrow(tupleset, target) => write!(f, "{tupleset}->{target}"),
            RewriteRule::Union(children) => write_operands(f, children, " + "),
            RewriteRule::Intersection(children) => write_operands(f, children, " & "),
            RewriteRule::Exclusion(base, excluded) => {
                write_operand(f, base)?;
                f.write_str(" - ")?;
                write_operand(f, excluded)
            }
        }
    }
}

fn write_operands(f: &mut fmt::Formatter<'_>, children: &[RewriteRule], op: &str) -> fmt::Result {
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            f.write_str(op)?;
        }
        write_operand(f, child)?;
    }
    Ok(())
}

fn write_operand(f: &mut fmt::Formatter<'_>, rule: &RewriteRule) -> fmt::Result {
    match rule {
        RewriteRule::This(_) | RewriteRule::Arrow(_, _) => write!(f, "{rule}"),
        _ => write!(f, "({rule})"),
    }
}

/// Renders a schema in canonical text form. Parsing the output yields an equal model.
pub fn render_schema(schema: &Schema) -> String {
    let mut out = String::new();
    for (i, type_def) in schema.types.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if type_def.relations.is_empty() && type_def.permissions.is_empty() {
            let _ = writeln!(out, "definition {} {{}}", type_def.name);
            continue;
        }
        let _ = writeln!(out, "definition {} {{", type_def.name);
        for rel in &type_def.relations {
            let subjects = rel
                .subject_types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" | ");
            let _ = writeln!(out, "    relation {}: {subjects}", rel.name);
        }
        for perm in &type_def.permissions {
            let _ = writeln!(out, "    permission {} = {}", perm.name, perm.rule);
        }
        out.push_str("}\n");
    }
    out
}
