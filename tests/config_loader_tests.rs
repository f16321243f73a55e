use activity_ingest::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("INGEST_"))
        .collect();
    for key in keys {
        unsafe {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader(&temp_dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.health_bind_addr, "0.0.0.0:8081");
    assert_eq!(cfg.log_level, "info");
    assert!(cfg.redis_url.is_none());
    assert_eq!(cfg.pipeline.job_state_ttl_seconds, 86_400);
    assert_eq!(cfg.pipeline.lock_ttl_seconds, 600);
    assert_eq!(cfg.pipeline.not_ready_max_tries, 10);
    assert_eq!(cfg.pipeline.error_suspend_threshold, 5);
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "INGEST_HEALTH_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "INGEST_HEALTH_BIND_ADDR=192.168.0.10:5000\nINGEST_WORKER_CONCURRENCY=8\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "INGEST_HEALTH_BIND_ADDR=10.0.0.5:6000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "INGEST_PROFILE=test\nINGEST_HEALTH_BIND_ADDR=127.0.0.1:4000\n",
    );

    let cfg = loader(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.health_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.worker.concurrency, 8);
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "INGEST_HEALTH_BIND_ADDR=127.0.0.1:3000\nINGEST_LOCK_TTL_SECONDS=300\n",
    );

    unsafe {
        env::set_var("INGEST_HEALTH_BIND_ADDR", "0.0.0.0:9090");
    }

    let cfg = loader(&temp_dir)
        .load()
        .expect("config loads with env override");
    assert_eq!(cfg.health_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.pipeline.lock_ttl_seconds, 300);

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("INGEST_HEALTH_BIND_ADDR", "not-an-addr");
    }
    let temp_dir = TempDir::new().unwrap();
    let err = loader(&temp_dir)
        .load()
        .expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid health bind address"));

    clear_env();
}

#[test]
fn unparsable_numbers_name_the_variable() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("INGEST_WORKER_CONCURRENCY", "lots");
    }
    let temp_dir = TempDir::new().unwrap();
    let err = loader(&temp_dir).load().expect_err("non-numeric value should fail");
    assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "WORKER_CONCURRENCY"));

    clear_env();
}

#[test]
fn deployed_profiles_require_redis() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("INGEST_PROFILE", "prod");
    }
    let temp_dir = TempDir::new().unwrap();
    let err = loader(&temp_dir).load().expect_err("prod without redis should fail");
    assert!(matches!(err, ConfigError::MissingRedisUrl { .. }));

    unsafe {
        env::set_var("INGEST_REDIS_URL", "redis://cache:6379");
    }
    let cfg = loader(&temp_dir).load().expect("prod with redis loads");
    assert_eq!(cfg.redis_url.as_deref(), Some("redis://cache:6379"));

    clear_env();
}

#[test]
fn lock_may_not_outlive_job_state() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("INGEST_JOB_STATE_TTL_SECONDS", "300");
        env::set_var("INGEST_LOCK_TTL_SECONDS", "600");
    }
    let temp_dir = TempDir::new().unwrap();
    let err = loader(&temp_dir).load().expect_err("lock ttl above store ttl");
    assert!(matches!(
        err,
        ConfigError::LockOutlivesJobState {
            lock: 600,
            job_state: 300
        }
    ));

    clear_env();
}
