//! Bootstraps an Admin account on a freshly migrated database.
//!
//! Usage: create_admin <username> <password> [display name]

use anyhow::{bail, Context};
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHasher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter("info").init();

    let mut args = std::env::args().skip(1);
    let (Some(username), Some(password)) = (args.next(), args.next()) else {
        bail!("usage: create_admin <username> <password> [display name]");
    };
    let display_name = args.next().unwrap_or_else(|| "Administrator".to_string());
    if password.chars().count() < 8 {
        bail!("password must be at least 8 characters");
    }

    let salt = SaltString::generate(&mut OsRng);
    let phc = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash error: {e}"))?
        .to_string();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
    let pool = sqlx::PgPool::connect(&database_url).await?;

    let user_id: uuid::Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO app_user (username, display_name, password_hash, role_id)
        SELECT $1, $2, $3, role_id FROM role WHERE name = 'Admin'
        ON CONFLICT (username)
        DO UPDATE SET password_hash = EXCLUDED.password_hash,
                      role_id = EXCLUDED.role_id,
                      is_active = true,
                      updated_at = now()
        RETURNING user_id
        "#,
    )
    .bind(username.trim())
    .bind(display_name.trim())
    .bind(&phc)
    .fetch_optional(&pool)
    .await?
    .context("Admin role not found; run the migrations first")?;

    tracing::info!(%user_id, username = %username.trim(), "admin account ready");
    Ok(())
}
