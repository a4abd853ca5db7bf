//! 编译期生成 GIT_SHA、BUILD_TIMESTAMP 等元信息（供 version.rs 使用）
//! 以及 SDK_DB_VERSION（从 migrations/ 目录扫描 V{version}__*.sql 取最大版本号）

use std::env;
use std::fs;
use std::path::Path;
use vergen::EmitBuilder;

fn main() {
    let _ = EmitBuilder::builder()
        .build_timestamp()
        .git_sha(false)
        .emit();

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR");
    let migrations_dir = Path::new(&manifest_dir).join("migrations");
    println!("cargo:rustc-env=SDK_DB_VERSION={}", max_migration_version(&migrations_dir));
    println!("cargo:rerun-if-changed=migrations/");
}

/// refinery 文件名格式: V{version}__{name}.sql
fn max_migration_version(dir: &Path) -> i64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str().map(str::to_owned))
        .filter(|name| name.starts_with('V') && name.ends_with(".sql"))
        .filter_map(|name| {
            name[1..name.len() - 4]
                .split("__")
                .next()
                .and_then(|v| v.parse::<i64>().ok())
        })
        .max()
        .unwrap_or(0)
}
