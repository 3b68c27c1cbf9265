use std::{env, process::Command};

const TAG_VAR: &str = "RC_BUILD_GIT_TAG";
const COMMIT_VAR: &str = "RC_BUILD_GIT_COMMIT";
const DIRTY_VAR: &str = "RC_BUILD_GIT_DIRTY";

fn main() {
    for var in [TAG_VAR, COMMIT_VAR, DIRTY_VAR] {
        println!("cargo:rerun-if-env-changed={var}");
    }

    let git_tag = env::var(TAG_VAR).ok().unwrap_or_else(|| {
        git_output(&["describe", "--tags", "--exact-match"]).unwrap_or_else(|| "untagged".into())
    });
    let git_commit = env::var(COMMIT_VAR).ok().unwrap_or_else(|| {
        git_output(&["rev-parse", "--short=12", "HEAD"]).unwrap_or_else(|| "unknown".into())
    });
    let git_dirty = env::var(DIRTY_VAR).ok().unwrap_or_else(|| {
        let changed = git_output(&["status", "--porcelain", "--untracked-files=no"])
            .is_some_and(|output| !output.is_empty());
        changed.to_string()
    });

    println!("cargo:rustc-env={TAG_VAR}={git_tag}");
    println!("cargo:rustc-env={COMMIT_VAR}={git_commit}");
    println!("cargo:rustc-env={DIRTY_VAR}={git_dirty}");
}

fn git_output(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    Some(text.trim().to_string())
}
