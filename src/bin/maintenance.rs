use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use diesel::prelude::*;
use tracing_subscriber::EnvFilter;

use schoolshelf::{
    auth::password::hash_password,
    config::AppConfig,
    db, media,
    schema::images,
    storage::{LocalStorage, PublicStorage},
};

const USAGE: &str = "Usage: maintenance <convert-pdf <pdf>|hash-password <password>|prune-images>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("convert-pdf") => {
            let source = args.next().context("convert-pdf needs a PDF path")?;
            convert_pdf(PathBuf::from(source))?
        }
        Some("hash-password") => {
            let password = args.next().context("hash-password needs a password")?;
            println!("{}", hash_password(&password)?);
        }
        Some("prune-images") => prune_images().await?,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn public_root() -> PathBuf {
    env::var("PUBLIC_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("public"))
}

fn convert_pdf(source: PathBuf) -> Result<()> {
    let root = public_root();
    let source = if source.is_file() {
        source
    } else {
        root.join(&source)
    };
    if !source.is_file() {
        bail!("{} is not a file", source.display());
    }

    let pages = media::convert_pdf_to_images(&source, &root)?;
    println!("Converted {} page(s):", pages.len());
    for page in pages {
        println!("  {page}");
    }
    Ok(())
}

/// Drops image rows whose file has disappeared from the public root.
async fn prune_images() -> Result<()> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        public_dir = %config.public_dir.display(),
        "loaded configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let storage = LocalStorage::new(config.public_dir.clone());

    let mut conn = pool.get().context("failed to get database connection")?;
    let rows: Vec<(i32, String)> = images::table
        .select((images::id, images::path))
        .order(images::id.asc())
        .load(&mut conn)
        .context("failed to load images")?;

    let mut orphaned = Vec::new();
    for (id, path) in &rows {
        match storage.exists(path).await {
            Ok(true) => {}
            Ok(false) => orphaned.push(*id),
            Err(err) => eprintln!("Skipping image {id} ({path}): {err}"),
        }
    }

    if orphaned.is_empty() {
        println!("All {} image records point at existing files.", rows.len());
        return Ok(());
    }

    let deleted = diesel::delete(images::table.filter(images::id.eq_any(&orphaned)))
        .execute(&mut conn)
        .context("failed to remove orphaned image records")?;
    println!("Removed {deleted} orphaned image record(s).");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
