use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub is_admin: bool,
    pub school_id: Option<i32>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub is_admin: bool,
    pub school_id: Option<i32>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = schools)]
pub struct School {
    pub id: i32,
    pub name: String,
    pub school_type: String,
    pub is_admin: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = schools)]
pub struct NewSchool {
    pub name: String,
    pub school_type: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = grades)]
pub struct Grade {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = subjects)]
pub struct Subject {
    pub id: i32,
    pub name: String,
    pub grade_id: Option<i32>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = topics)]
pub struct Topic {
    pub id: i32,
    pub name: String,
    pub subject_id: Option<i32>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = file_types)]
pub struct FileType {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = voice_types)]
pub struct VoiceType {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = files)]
pub struct File {
    pub id: i32,
    pub name: String,
    pub path: Option<String>,
    pub parent_id: Option<i32>,
    pub created_by: Option<i32>,
    pub school_id: Option<i32>,
    pub filetype_id: Option<i32>,
    pub topic_id: Option<i32>,
    pub subject_id: Option<i32>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = files)]
pub struct NewFile {
    pub name: String,
    pub path: Option<String>,
    pub parent_id: Option<i32>,
    pub created_by: Option<i32>,
    pub school_id: Option<i32>,
    pub filetype_id: Option<i32>,
    pub topic_id: Option<i32>,
    pub subject_id: Option<i32>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = images)]
pub struct Image {
    pub id: i32,
    pub name: String,
    pub path: String,
    pub file_id: i32,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = images)]
pub struct NewImage {
    pub name: String,
    pub path: String,
    pub file_id: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = voices)]
pub struct Voice {
    pub id: i32,
    pub name: String,
    pub path: String,
    pub file_id: i32,
    pub type_voice_id: Option<i32>,
}
