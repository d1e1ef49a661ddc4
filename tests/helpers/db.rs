use migration::MigratorTrait;
use sea_orm::{Database, DatabaseConnection};
use tempfile::NamedTempFile;

use tether::settings::Settings;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    pub fn connection(&self) -> DatabaseConnection {
        self.connection.clone()
    }
}

/// Settings tuned for tests: a known API key and signing headers, default
/// everything else.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.api_key.key = "test-api-key".to_string();
    settings
}

/// Create a test user
pub async fn seed_user(db: &DatabaseConnection, email: &str, password: &str) -> tether::storage::User {
    tether::storage::create_user(db, email, password, Some("tenant-1".to_string()), "member")
        .await
        .expect("Failed to create test user")
}
