use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        // Create temporary SQLite database file
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        // Connect to database
        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        // Run migrations
        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

/// Snapshot the effective-assignment table as sorted (role, principal, node)
/// tuples for exact comparisons.
pub async fn effective_tuples(db: &DatabaseConnection) -> Vec<(i32, i32, i32)> {
    use palisade::entities::effective_assignment::Entity;
    use sea_orm::EntityTrait;

    let mut rows: Vec<(i32, i32, i32)> = Entity::find()
        .all(db)
        .await
        .expect("Failed to read effective assignments")
        .into_iter()
        .map(|ea| (ea.role_id, ea.principal_id, ea.node_id))
        .collect();
    rows.sort_unstable();
    rows
}
