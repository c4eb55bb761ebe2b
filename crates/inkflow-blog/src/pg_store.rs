//! Postgres adapter of [`BlogStore`].

use crate::model::{Blog, BlogId, BlogPage, Pagination};
use crate::query::BlogQuery;
use crate::store::BlogStore;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use inkflow_config::DatabaseConfig;
use inkflow_core::{InkflowError, InkflowResult};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, warn};

const SELECT_COLUMNS: &str =
    "SELECT id, title, description, blogcontent, image, category, author, create_at FROM blogs";

// $1 search flag, $2 ILIKE pattern, $3 category
const FILTER: &str = "WHERE ($1 = '' OR title ILIKE $2 OR description ILIKE $2) AND ($3 = '' OR category = $3)";

/// Reads blogs from the `blogs` table.
#[derive(Clone)]
pub struct PgBlogStore {
    pool: PgPool,
}

impl PgBlogStore {
    /// Open a connection pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> InkflowResult<Self> {
        info!("Connecting to Postgres database...");

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .map_err(|e| {
                warn!("Failed to connect to database: {}", e);
                InkflowError::Database(format!("Failed to connect: {}", e))
            })?;

        info!("Postgres connection pool established");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Checks if the database connection is healthy.
    pub async fn health_check(&self) -> InkflowResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| InkflowError::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Debug, FromRow)]
struct BlogRow {
    id: i32,
    title: Option<String>,
    description: Option<String>,
    blogcontent: Option<String>,
    image: Option<String>,
    category: Option<String>,
    author: Option<String>,
    create_at: Option<NaiveDateTime>,
}

impl From<BlogRow> for Blog {
    fn from(row: BlogRow) -> Self {
        Blog {
            id: row.id,
            title: row.title.unwrap_or_default(),
            description: row.description.unwrap_or_default(),
            content: row.blogcontent.unwrap_or_default(),
            image: row.image.unwrap_or_default(),
            category: row.category.unwrap_or_default(),
            author: row.author.unwrap_or_default(),
            create_at: row.create_at,
        }
    }
}

fn db_error(context: &str, e: sqlx::Error) -> InkflowError {
    InkflowError::Database(format!("{}: {}", context, e))
}

#[async_trait]
impl BlogStore for PgBlogStore {
    async fn fetch_page(&self, query: &BlogQuery) -> InkflowResult<BlogPage> {
        let like = format!("%{}%", query.search());
        let limit = i64::from(query.limit());
        let offset = i64::try_from(query.offset()).unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, BlogRow>(&format!(
            "{} {} ORDER BY create_at DESC LIMIT $4 OFFSET $5",
            SELECT_COLUMNS, FILTER
        ))
        .bind(query.search())
        .bind(&like)
        .bind(query.category())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch blogs", e))?;

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM blogs {}", FILTER))
            .bind(query.search())
            .bind(&like)
            .bind(query.category())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("Failed to count blogs", e))?;

        debug!(
            search = query.search(),
            category = query.category(),
            page = query.page(),
            rows = rows.len(),
            total,
            "Fetched blog page"
        );

        Ok(BlogPage {
            blogs: rows.into_iter().map(Blog::from).collect(),
            pagination: Pagination::new(
                u64::try_from(total).unwrap_or_default(),
                query.page(),
                query.limit(),
            ),
        })
    }

    async fn fetch_blog(&self, id: BlogId) -> InkflowResult<Option<Blog>> {
        let row = sqlx::query_as::<_, BlogRow>(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to fetch blog", e))?;

        Ok(row.map(Blog::from))
    }
}
