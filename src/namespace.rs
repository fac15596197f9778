// Namespace validation: database and collection names become PostgreSQL schema and
// table identifiers, so they are checked before any SQL is built.

use std::fmt;

/// PostgreSQL truncates identifiers beyond this many bytes.
pub const MAX_NAME_LEN: usize = 63;

const DB_FORBIDDEN: &[char] = &['.', '/', '\\', ' ', '"', '$'];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct InvalidNamespace(pub String);

fn check_common(kind: &str, name: &str) -> Result<(), InvalidNamespace> {
    if name.is_empty() {
        return Err(InvalidNamespace(format!("{kind} name cannot be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(InvalidNamespace(format!(
            "{kind} name {name:?} is longer than {MAX_NAME_LEN} bytes"
        )));
    }
    if name.contains('\0') {
        return Err(InvalidNamespace(format!("{kind} name cannot contain NUL")));
    }
    Ok(())
}

pub fn validate_database(name: &str) -> Result<(), InvalidNamespace> {
    check_common("database", name)?;
    if let Some(c) = name.chars().find(|c| DB_FORBIDDEN.contains(c)) {
        return Err(InvalidNamespace(format!(
            "database name {name:?} cannot contain {c:?}"
        )));
    }
    Ok(())
}

pub fn validate_collection(name: &str) -> Result<(), InvalidNamespace> {
    check_common("collection", name)?;
    if name.starts_with("system.") {
        return Err(InvalidNamespace(format!(
            "collection name {name:?} is reserved"
        )));
    }
    if name.contains('$') {
        return Err(InvalidNamespace(format!(
            "collection name {name:?} cannot contain '$'"
        )));
    }
    Ok(())
}

/// A validated `<db>.<collection>` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: &str, coll: &str) -> Result<Self, InvalidNamespace> {
        validate_database(db)?;
        validate_collection(coll)?;
        Ok(Self {
            db: db.to_string(),
            coll: coll.to_string(),
        })
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_names() {
        let ns = Namespace::new("test", "widgets").unwrap();
        assert_eq!(ns.to_string(), "test.widgets");
        assert!(Namespace::new("my-db_1", "a.b.c").is_ok());
    }

    #[test]
    fn rejects_unusable_database_names() {
        for bad in ["", "a.b", "a b", "a$", "a\"b", "a/b", "a\\b", "a\0b"] {
            assert!(validate_database(bad).is_err(), "{bad:?}");
        }
        assert!(validate_database(&"d".repeat(MAX_NAME_LEN)).is_ok());
        assert!(validate_database(&"d".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn rejects_unusable_collection_names() {
        for bad in ["", "system.users", "a$b", "x\0"] {
            assert!(validate_collection(bad).is_err(), "{bad:?}");
        }
        // quotes are legal here; quoting handles them
        assert!(validate_collection("we\"ird").is_ok());
    }
}
