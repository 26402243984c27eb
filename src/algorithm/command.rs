//! Algorithm adapter that runs one external process per unit.
//!
//! The request is a JSON object on stdin, the outcome a JSON object on
//! stdout:
//!
//! ```text
//! -> {"op":"compute_pair","a":{..section..},"b":{..},"params":{..}}
//! <- {"status":"resolved","transform":{"translation":[dy,dx]},"confidence":0.93}
//!
//! -> {"op":"compute_mask","section":{..},"layout":{..},"tile":{..},"params":{..}}
//! <- {"status":"resolved","smear":{"height":..,"width":..,"runs":[[0,640]]},"resin":{..}}
//! ```
//!
//! A non-zero exit, unparseable output or a unit outliving its timeout makes
//! the unit unresolved.

use super::{
    EncodedMasks, PairAligner, PairEstimate, TileMasker, TileMasks, UnitOutcome,
};
use crate::index::{Section, Tile, TileLayout};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    ComputePair {
        a: &'a Section,
        b: &'a Section,
        params: &'a serde_json::Value,
    },
    ComputeMask {
        section: &'a Section,
        layout: &'a TileLayout,
        tile: &'a Tile,
        params: &'a serde_json::Value,
    },
}

/// Runs `program args..` once per unit.
#[derive(Debug, Clone)]
pub struct CommandAlgorithm {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAlgorithm {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Kill a unit that runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn call<T: DeserializeOwned>(&self, request: &Request<'_>) -> UnitOutcome<T> {
        match self.try_call(request) {
            Ok(outcome) => outcome,
            Err(reason) => UnitOutcome::unresolved(reason),
        }
    }

    fn try_call<T: DeserializeOwned>(&self, request: &Request<'_>) -> Result<UnitOutcome<T>, String> {
        let body = serde_json::to_vec(request).map_err(|e| format!("encode request: {}", e))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("cannot launch {}: {}", self.program, e))?;

        // Request and both output pipes move concurrently so a large request
        // or early output cannot fill a pipe buffer and stall both sides.
        let writer = child
            .stdin
            .take()
            .map(|mut stdin| thread::spawn(move || stdin.write_all(&body)));
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("{} timed out after {:?}", self.program, self.timeout));
                }
                Ok(None) => thread::sleep(WAIT_POLL),
                Err(e) => return Err(format!("wait for {}: {}", self.program, e)),
            }
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let last = stderr.lines().last().unwrap_or("").trim();
            return Err(format!("{} exited with {}: {}", self.program, status, last));
        }
        if let Some(Ok(Err(e))) = writer.map(JoinHandle::join) {
            // A program may answer without reading its whole request
            if e.kind() != ErrorKind::BrokenPipe {
                return Err(format!("write request: {}", e));
            }
        }
        serde_json::from_slice(&stdout).map_err(|e| format!("malformed output: {}", e))
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

impl PairAligner for CommandAlgorithm {
    fn compute_pair(
        &self,
        a: &Section,
        b: &Section,
        params: &serde_json::Value,
    ) -> UnitOutcome<PairEstimate> {
        self.call(&Request::ComputePair { a, b, params })
    }
}

impl TileMasker for CommandAlgorithm {
    fn compute_mask(
        &self,
        section: &Section,
        layout: &TileLayout,
        tile: &Tile,
        params: &serde_json::Value,
    ) -> UnitOutcome<TileMasks> {
        let outcome: UnitOutcome<EncodedMasks> = self.call(&Request::ComputeMask {
            section,
            layout,
            tile,
            params,
        });
        let expected = (layout.tile_height, layout.tile_width);
        match outcome {
            UnitOutcome::Resolved(m)
                if (m.smear.height, m.smear.width) != expected
                    || (m.resin.height, m.resin.width) != expected =>
            {
                UnitOutcome::unresolved(format!(
                    "mask shape {}x{} does not match tile {}x{}",
                    m.smear.height, m.smear.width, expected.0, expected.1
                ))
            }
            other => other.map(|m| TileMasks {
                smear: m.smear.to_array(),
                resin: m.resin.to_array(),
            }),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandAlgorithm {
        CommandAlgorithm::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn pair() -> (Section, Section) {
        (Section::new(4, 0, "/d/s4_g0"), Section::new(5, 0, "/d/s5_g0"))
    }

    #[test]
    fn test_resolved_pair() {
        let algo = sh(
            r#"cat > /dev/null; echo '{"status":"resolved","transform":{"translation":[1.5,-2.0]},"confidence":0.8}'"#,
        );
        let (a, b) = pair();
        let outcome = algo.compute_pair(&a, &b, &serde_json::json!({}));
        let est = outcome.resolved().unwrap();
        assert_eq!(est.transform.translation, vec![1.5, -2.0]);
        assert_eq!(est.confidence, 0.8);
    }

    #[test]
    fn test_request_reaches_stdin() {
        // echo the op back as the unresolved reason
        let algo = sh(
            r#"op=$(sed -n 's/.*"op":"\([a-z_]*\)".*/\1/p'); echo "{\"status\":\"unresolved\",\"reason\":\"$op\"}""#,
        );
        let (a, b) = pair();
        match algo.compute_pair(&a, &b, &serde_json::json!({})) {
            UnitOutcome::Unresolved { reason } => assert_eq!(reason, "compute_pair"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failure_is_unresolved() {
        let (a, b) = pair();
        let crashed = sh("cat > /dev/null; echo 'no overlap found' >&2; exit 2");
        match crashed.compute_pair(&a, &b, &serde_json::json!({})) {
            UnitOutcome::Unresolved { reason } => assert!(reason.contains("no overlap found")),
            other => panic!("unexpected {:?}", other),
        }

        let garbage = sh("cat > /dev/null; echo not-json");
        assert!(!garbage.compute_pair(&a, &b, &serde_json::json!({})).is_resolved());

        let missing = CommandAlgorithm::new("/nonexistent/align", vec![]);
        assert!(!missing.compute_pair(&a, &b, &serde_json::json!({})).is_resolved());
    }

    #[test]
    fn test_large_request_with_early_output() {
        // 256 KiB of leading whitespace before the request is read, with a
        // request larger than any pipe buffer
        let algo = sh(
            r#"head -c 262144 /dev/zero | tr '\0' ' '; cat > /dev/null; echo '{"status":"resolved","transform":{"translation":[0.0,1.0]},"confidence":1.0}'"#,
        )
        .with_timeout(Duration::from_secs(30));
        let a = Section::new(4, 0, "x".repeat(300_000));
        let b = Section::new(5, 0, "/d/s5_g0");
        let outcome = algo.compute_pair(&a, &b, &serde_json::json!({}));
        assert_eq!(outcome.resolved().unwrap().transform.translation, vec![0.0, 1.0]);
    }

    #[test]
    fn test_hung_unit_times_out() {
        let algo = sh("exec sleep 30").with_timeout(Duration::from_millis(200));
        let (a, b) = pair();
        let started = Instant::now();
        match algo.compute_pair(&a, &b, &serde_json::json!({})) {
            UnitOutcome::Unresolved { reason } => assert!(reason.contains("timed out"), "{}", reason),
            other => panic!("unexpected {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_mask_shape_checked() {
        let layout = TileLayout {
            grid_shape: [1, 1],
            tile_height: 4,
            tile_width: 2,
            tile_overlap: 0,
            tiles: vec![Tile { id: 1, row: 0, col: 0, path: "t.tif".into() }],
        };
        let section = Section::new(0, 0, "/d/s0_g0").with_layout(layout.clone());
        let tile = &layout.tiles[0];

        let ok = sh(
            r#"cat > /dev/null; echo '{"status":"resolved","smear":{"height":4,"width":2,"runs":[[0,2]]},"resin":{"height":4,"width":2,"runs":[]}}'"#,
        );
        let masks = ok.compute_mask(&section, &layout, tile, &serde_json::json!({}));
        let masks = masks.resolved().unwrap();
        assert_eq!(masks.smear.dim(), (4, 2));
        assert!(masks.smear[[0, 1]]);
        assert!(!masks.smear[[1, 0]]);

        let wrong = sh(
            r#"cat > /dev/null; echo '{"status":"resolved","smear":{"height":2,"width":2,"runs":[]},"resin":{"height":2,"width":2,"runs":[]}}'"#,
        );
        assert!(!wrong.compute_mask(&section, &layout, tile, &serde_json::json!({})).is_resolved());
    }
}
