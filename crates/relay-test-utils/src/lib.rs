//! Shared test fixtures: temp data directories and fake-agent shell scripts
//! that stand in for the real agent binary.
//!
//! The fake agents speak the same stream-json line protocol the harness
//! parses, so supervisor and executor tests exercise the full spawn /
//! stream / kill path against real subprocesses.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use relay_store::{DataDir, JsonStore};

/// A temp `data/` tree plus an initialized store. Dropping removes it.
pub struct TempData {
    /// Kept for its Drop; the field itself is never read.
    _tmp: tempfile::TempDir,
    pub store: Arc<JsonStore>,
    pub root: PathBuf,
}

impl TempData {
    pub async fn new() -> Self {
        let tmp = tempfile::tempdir().expect("failed to create temp dir");
        let root = tmp.path().to_path_buf();
        let store = Arc::new(JsonStore::new(DataDir::new(root.join("data"))));
        store.init().await.expect("failed to init store");
        Self {
            _tmp: tmp,
            store,
            root,
        }
    }
}

/// Write an executable shell script and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("failed to write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod script");
    }
    path
}

/// A fake research agent: finds the output path named in its prompt (the
/// last `.md` token), writes `out-<nodeId>` there, and emits one result
/// event. Mirrors a well-behaved child.
pub fn scripted_researcher(dir: &Path, name: &str) -> PathBuf {
    write_script(
        dir,
        name,
        r#"#!/bin/sh
prompt="$2"
out=$(printf '%s' "$prompt" | grep -oE '[^ ]+\.md' | tail -n 1)
if [ -n "$out" ]; then
  node=$(basename "$out" .md)
  printf 'out-%s' "$node" > "$out"
fi
echo '{"type":"assistant","toolName":"Write","toolInput":{"file_path":"'"$out"'"}}'
echo '{"type":"result","resultText":"done","isError":false,"inputTokens":1000,"outputTokens":500}'
exit 0
"#,
    )
}

/// A fake agent that always fails: error result, exit 1, no output file.
pub fn failing_agent(dir: &Path, name: &str) -> PathBuf {
    write_script(
        dir,
        name,
        r#"#!/bin/sh
echo '{"type":"result","resultText":"could not finish","isError":true,"inputTokens":100,"outputTokens":50}'
echo 'simulated failure' >&2
exit 1
"#,
    )
}

/// A fake agent that fails only when its prompt mentions `marker`; succeeds
/// like [`scripted_researcher`] otherwise.
pub fn selectively_failing_researcher(dir: &Path, name: &str, marker: &str) -> PathBuf {
    write_script(
        dir,
        name,
        &format!(
            r#"#!/bin/sh
prompt="$2"
case "$prompt" in
  *{marker}*)
    echo '{{"type":"result","resultText":"boom","isError":true}}'
    exit 1
    ;;
esac
out=$(printf '%s' "$prompt" | grep -oE '[^ ]+\.md' | tail -n 1)
if [ -n "$out" ]; then
  node=$(basename "$out" .md)
  printf 'out-%s' "$node" > "$out"
fi
echo '{{"type":"result","resultText":"done","isError":false,"inputTokens":1000,"outputTokens":500}}'
exit 0
"#
        ),
    )
}

/// A fake agent that emits `n` assistant events, then sleeps far past any
/// test timeout so a kill condition must terminate it.
pub fn tool_spammer(dir: &Path, name: &str, n: usize) -> PathBuf {
    let mut body = String::from("#!/bin/sh\n");
    for i in 0..n {
        body.push_str(&format!(
            "echo '{{\"type\":\"assistant\",\"toolName\":\"Bash\",\"toolInput\":{{\"command\":\"step {i} ./run.sh\"}}}}'\n"
        ));
    }
    body.push_str("sleep 3600\n");
    write_script(dir, name, &body)
}

/// A fake agent that produces nothing and sleeps forever.
pub fn sleepy_agent(dir: &Path, name: &str) -> PathBuf {
    write_script(dir, name, "#!/bin/sh\nsleep 3600\n")
}
