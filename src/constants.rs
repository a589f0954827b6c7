//! Centralized constants shared across the crate.

// Substitution
pub const SUBST_MAX_PASSES: usize = 50;

// Loader file names
pub const ROOT_MANIFEST: &str = "hdt.yaml";
pub const VHOST_MANIFEST: &str = "vhost.yaml";
pub const IGNORE_FILE: &str = ".hdtignore";
pub const SWAGGER_PREFIX: &str = "swagger-";

// HTTP
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

// Environment variables
pub const ENV_HDT_LOG: &str = "HDT_LOG";
pub const ENV_HDT_LOG_FORMAT: &str = "HDT_LOG_FORMAT";
pub const ENV_HDT_LOG_FILE: &str = "HDT_LOG_FILE";
pub const ENV_HDT_TIMEOUT_MS: &str = "HDT_TIMEOUT_MS";

// Serialization queue key prefix for combination variants of one test unit.
pub const COMBO_QUEUE_PREFIX: &str = "combo:";

// Exit codes
pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 1;
pub const EXIT_RUN_FAILED: i32 = 1;
pub const EXIT_GENDOC: i32 = 2;
pub const EXIT_COMPILE: i32 = 3;
