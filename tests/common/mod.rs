use std::env;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::MigrationHarness;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use schoolshelf::auth::jwt::JwtService;
use schoolshelf::auth::password::hash_password;
use schoolshelf::config::{AppConfig, DEFAULT_MAX_UPLOAD_MB};
use schoolshelf::db::{self, PgPool, MIGRATIONS};
use schoolshelf::models::{NewFile, NewImage, NewSchool, NewUser};
use schoolshelf::routes;
use schoolshelf::schema::{
    files, grades, images, schools, subjects, user_subjects, users, voices,
};
use schoolshelf::state::AppState;
use schoolshelf::storage::{LocalStorage, PublicStorage};
use serde::Serialize;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub struct TestApp {
    pub state: AppState,
    router: Router,
    public_dir: TempDir,
}

/// A multipart part sent by [`TestApp::upload`].
#[allow(dead_code)]
pub enum Part<'a> {
    Text(&'a str, &'a str),
    File {
        field: &'a str,
        filename: &'a str,
        content_type: &'a str,
        data: &'a [u8],
    },
}

impl TestApp {
    /// `None` when `TEST_DATABASE_URL` is not set; callers skip the test.
    pub async fn new() -> Result<Option<Self>> {
        let Ok(database_url) = env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set; skipping database test");
            return Ok(None);
        };

        let public_dir = TempDir::new().context("failed to create public dir")?;
        let config = AppConfig {
            database_url,
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: "test-issuer".to_string(),
            jwt_audience: "test-audience".to_string(),
            jwt_expiry_minutes: 60,
            cors_allowed_origin: None,
            public_dir: public_dir.path().to_path_buf(),
            max_upload_mb: DEFAULT_MAX_UPLOAD_MB,
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage: Arc<dyn PublicStorage> = Arc::new(LocalStorage::new(public_dir.path()));
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(pool, config, storage, jwt);
        let router = routes::create_router(state.clone());

        Ok(Some(Self {
            state,
            router,
            public_dir,
        }))
    }

    pub async fn cleanup(&self) -> Result<()> {
        self.with_conn(|conn| truncate_all(conn)).await
    }

    #[allow(dead_code)]
    pub fn public_path(&self, key: &str) -> PathBuf {
        self.public_dir.path().join(key)
    }

    #[allow(dead_code)]
    pub fn write_public(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.public_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes).with_context(|| format!("failed to write {key}"))
    }

    #[allow(dead_code)]
    pub async fn insert_school(&self, name: &str, school_type: &str, is_admin: bool) -> Result<i32> {
        let school = NewSchool {
            name: name.to_string(),
            school_type: school_type.to_string(),
            is_admin,
        };
        self.with_conn(move |conn| {
            diesel::insert_into(schools::table)
                .values(&school)
                .returning(schools::id)
                .get_result(conn)
                .context("failed to insert school")
        })
        .await
    }

    pub async fn insert_user(
        &self,
        username: &str,
        password: &str,
        role: &str,
        school_id: Option<i32>,
    ) -> Result<i32> {
        let username = username.to_string();
        let password = password.to_string();
        let role = role.to_string();
        self.with_conn(move |conn| {
            let user = NewUser {
                username,
                password_hash: hash_password(&password)?,
                is_admin: role == "admin",
                role,
                school_id,
            };
            diesel::insert_into(users::table)
                .values(&user)
                .returning(users::id)
                .get_result(conn)
                .context("failed to insert user")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn delete_user(&self, user_id: i32) -> Result<()> {
        self.with_conn(move |conn| {
            diesel::delete(users::table.find(user_id))
                .execute(conn)
                .context("failed to delete user")?;
            Ok(())
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_grade(&self, name: &str) -> Result<i32> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            diesel::insert_into(grades::table)
                .values(grades::name.eq(name))
                .returning(grades::id)
                .get_result(conn)
                .context("failed to insert grade")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_subject(&self, name: &str, grade_id: Option<i32>) -> Result<i32> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            diesel::insert_into(subjects::table)
                .values((subjects::name.eq(name), subjects::grade_id.eq(grade_id)))
                .returning(subjects::id)
                .get_result(conn)
                .context("failed to insert subject")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn assign_subject(&self, user_id: i32, subject_id: i32) -> Result<()> {
        self.with_conn(move |conn| {
            diesel::insert_into(user_subjects::table)
                .values((
                    user_subjects::user_id.eq(user_id),
                    user_subjects::subject_id.eq(subject_id),
                ))
                .execute(conn)
                .context("failed to assign subject")?;
            Ok(())
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_file(&self, file: NewFile) -> Result<i32> {
        self.with_conn(move |conn| {
            diesel::insert_into(files::table)
                .values(&file)
                .returning(files::id)
                .get_result(conn)
                .context("failed to insert file")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_image(&self, file_id: i32, path: &str) -> Result<i32> {
        let image = NewImage {
            name: format!("image of {file_id}"),
            path: path.to_string(),
            file_id,
        };
        self.with_conn(move |conn| {
            diesel::insert_into(images::table)
                .values(&image)
                .returning(images::id)
                .get_result(conn)
                .context("failed to insert image")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_voice(&self, file_id: i32, path: &str) -> Result<i32> {
        let path = path.to_string();
        self.with_conn(move |conn| {
            diesel::insert_into(voices::table)
                .values((
                    voices::name.eq(format!("reading of {file_id}")),
                    voices::path.eq(path),
                    voices::file_id.eq(file_id),
                ))
                .returning(voices::id)
                .get_result(conn)
                .context("failed to insert voice")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn voice_count(&self) -> Result<i64> {
        self.with_conn(|conn| Ok(voices::table.count().get_result(conn)?))
            .await
    }

    #[allow(dead_code)]
    pub async fn file_exists(&self, file_id: i32) -> Result<bool> {
        self.with_conn(move |conn| {
            let found: Option<i32> = files::table
                .find(file_id)
                .select(files::id)
                .first(conn)
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn image_count(&self) -> Result<i64> {
        self.with_conn(|conn| Ok(images::table.count().get_result(conn)?))
            .await
    }

    pub async fn login_token(&self, username: &str, password: &str) -> Result<String> {
        #[derive(Serialize)]
        struct LoginPayload<'a> {
            username: &'a str,
            password: &'a str,
        }

        let response = self
            .post_json(
                "/api/auth/login",
                &LoginPayload { username, password },
                None,
            )
            .await?;

        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );

        let body = body_to_json(response.into_body()).await?;
        body["access_token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("login response without access_token"))
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::POST, path, payload, token).await
    }

    #[allow(dead_code)]
    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::PATCH, path, payload, token).await
    }

    async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let builder = Request::builder().method(Method::DELETE).uri(path);
        let builder = if let Some(token) = token {
            builder.header("authorization", format!("Bearer {token}"))
        } else {
            builder
        };
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn upload(
        &self,
        path: &str,
        parts: &[Part<'_>],
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        for part in parts {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n")
                            .as_bytes(),
                    );
                    body.extend(value.as_bytes());
                }
                Part::File {
                    field,
                    filename,
                    content_type,
                    data,
                } => {
                    body.extend(
                        format!(
                            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
                    body.extend(*data);
                }
            }
            body.extend(b"\r\n");
        }
        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

/// A file row with every optional column empty.
#[allow(dead_code)]
pub fn new_file(name: &str, created_by: Option<i32>) -> NewFile {
    NewFile {
        name: name.to_string(),
        path: None,
        parent_id: None,
        created_by,
        school_id: None,
        filetype_id: None,
        topic_id: None,
        subject_id: None,
    }
}

#[allow(dead_code)]
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, image::ImageFormat::Png)
        .expect("encode png");
    cursor.into_inner()
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn body_to_json(body: Body) -> Result<Value> {
    let bytes = body_to_vec(body).await?;
    serde_json::from_slice(&bytes).context("response body is not JSON")
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE voices, images, files, user_subjects, users, topics, subjects, grades, \
         file_types, voice_types, schools RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
