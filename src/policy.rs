//! Who is asking, and which schools' files they may see.

use std::fmt;

use diesel::prelude::*;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::models::{School, User};
use crate::schema::{schools, user_subjects, users};

pub const SCHOOL_TYPE_PRIMARY: &str = "primary";
pub const SCHOOL_TYPE_LOWER_SECONDARY: &str = "lower_secondary";
pub const SCHOOL_TYPE_UPPER_SECONDARY: &str = "upper_secondary";
pub const SCHOOL_TYPE_MULTI_LEVEL: &str = "multi_level";

pub const SCHOOL_TYPES: &[&str] = &[
    SCHOOL_TYPE_PRIMARY,
    SCHOOL_TYPE_LOWER_SECONDARY,
    SCHOOL_TYPE_UPPER_SECONDARY,
    SCHOOL_TYPE_MULTI_LEVEL,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Principal,
    Admin,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "teacher" => Some(Self::Teacher),
            "principal" => Some(Self::Principal),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Teacher => "teacher",
            Self::Principal => "principal",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// School types whose shared resources a member of a `school_type` school may
/// browse. Single-level schools pair with themselves and multi-level schools;
/// multi-level schools and users without a school see every type.
pub fn compatible_school_types(school_type: Option<&str>) -> Vec<String> {
    match school_type {
        Some(kind) if kind != SCHOOL_TYPE_MULTI_LEVEL && SCHOOL_TYPES.contains(&kind) => {
            vec![kind.to_string(), SCHOOL_TYPE_MULTI_LEVEL.to_string()]
        }
        Some(kind) if !SCHOOL_TYPES.contains(&kind) => vec![kind.to_string()],
        _ => SCHOOL_TYPES.iter().map(|kind| kind.to_string()).collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchoolMembership {
    pub id: i32,
    pub school_type: String,
}

/// The user behind a request, with the relations visibility rules depend on.
#[derive(Debug, Clone)]
pub struct ActingUser {
    pub id: i32,
    pub role: Option<Role>,
    pub is_admin: bool,
    pub school: Option<SchoolMembership>,
    pub subject_ids: Vec<i32>,
}

impl ActingUser {
    pub fn compatible_school_types(&self) -> Vec<String> {
        compatible_school_types(self.school.as_ref().map(|school| school.school_type.as_str()))
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin || self.role == Some(Role::Admin)
    }

    /// Admins manage every file; everyone else only the files they created.
    pub fn can_manage(&self, created_by: Option<i32>) -> bool {
        self.is_admin() || created_by == Some(self.id)
    }
}

pub fn load_acting_user(conn: &mut PgConnection, user_id: i32) -> AppResult<ActingUser> {
    let user: User = users::table.find(user_id).first(conn)?;

    let school: Option<School> = match user.school_id {
        Some(school_id) => schools::table.find(school_id).first(conn).optional()?,
        None => None,
    };

    let subject_ids: Vec<i32> = user_subjects::table
        .filter(user_subjects::user_id.eq(user.id))
        .select(user_subjects::subject_id)
        .order(user_subjects::subject_id.asc())
        .load(conn)?;

    Ok(ActingUser {
        id: user.id,
        role: Role::parse(&user.role),
        is_admin: user.is_admin,
        school: school.map(|school| SchoolMembership {
            id: school.id,
            school_type: school.school_type,
        }),
        subject_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: Option<Role>, is_admin: bool) -> ActingUser {
        ActingUser {
            id: 7,
            role,
            is_admin,
            school: None,
            subject_ids: Vec::new(),
        }
    }

    #[test]
    fn single_level_schools_pair_with_multi_level() {
        assert_eq!(
            compatible_school_types(Some(SCHOOL_TYPE_PRIMARY)),
            vec!["primary".to_string(), "multi_level".to_string()]
        );
    }

    #[test]
    fn multi_level_and_missing_school_see_everything() {
        assert_eq!(compatible_school_types(Some(SCHOOL_TYPE_MULTI_LEVEL)).len(), 4);
        assert_eq!(compatible_school_types(None).len(), SCHOOL_TYPES.len());
    }

    #[test]
    fn unknown_school_type_only_matches_itself() {
        assert_eq!(
            compatible_school_types(Some("vocational")),
            vec!["vocational".to_string()]
        );
    }

    #[test]
    fn parses_roles_case_insensitively() {
        assert_eq!(Role::parse("Teacher"), Some(Role::Teacher));
        assert_eq!(Role::parse(" PRINCIPAL "), Some(Role::Principal));
        assert_eq!(Role::parse("janitor"), None);
    }

    #[test]
    fn creators_and_admins_can_manage() {
        assert!(user(Some(Role::Teacher), false).can_manage(Some(7)));
        assert!(!user(Some(Role::Teacher), false).can_manage(Some(8)));
        assert!(!user(Some(Role::Teacher), false).can_manage(None));
        assert!(user(Some(Role::Principal), true).can_manage(Some(8)));
        assert!(user(Some(Role::Admin), false).can_manage(None));
    }
}
