mod c;
mod clang;

pub use c::emit_source;
pub use clang::clang_path;

use crate::color::do_color;
use crate::common::{BufferKind, Dtype};
use crate::evaluator::{Backend, BackendError, InputBuffers};
use crate::syntax::SyntaxTree;
use crate::utils::ToWriteFmt;

use anyhow::{anyhow, bail, Error, Result};
use log::{debug, warn};
use parking_lot::Mutex;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const CLI_FLAGS: [&str; 3] = ["-std=gnu99", "-O3", "-o"];
const CLI_VEC_FLAGS: [&str; 1] = ["-fopenmp"];
const LINK_FLAGS: [&str; 1] = ["-lm"];

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Builds trees as native kernels with Clang.
pub struct ClangBackend {
    compiler: String,
}

/// A compiled kernel and the temporary directory holding it.
pub struct ClangKernel {
    dir: TempDir,
    binary_path: PathBuf,
    input_dtypes: Vec<(String, Dtype)>,
    inputs_written: Mutex<bool>,
}

impl ClangBackend {
    /// A backend using the compiler named by the `CLANG` environment variable.
    pub fn new() -> Result<Self> {
        Ok(Self::with_compiler(clang_path()?))
    }

    pub fn with_compiler(compiler: impl Into<String>) -> Self {
        ClangBackend {
            compiler: compiler.into(),
        }
    }

    fn compile(
        &self,
        tree: &SyntaxTree,
        deadline: Option<Instant>,
    ) -> Result<ClangKernel, BackendError> {
        if past(deadline) {
            return Err(BackendError::Timeout);
        }
        let dir = tempfile::tempdir().map_err(|e| BackendError::Harness(e.into()))?;
        let source_path = dir.path().join("main.c");
        let binary_path = dir.path().join("a.out");

        let source_file =
            std::fs::File::create(&source_path).map_err(|e| BackendError::Harness(e.into()))?;
        emit_source(tree, &mut ToWriteFmt(source_file))
            .map_err(|e| BackendError::Harness(e.into()))?;

        let mut clang_cmd = Command::new(&self.compiler);
        if do_color() {
            clang_cmd.arg("-fcolor-diagnostics");
        }
        let clang_child = clang_cmd
            .args(CLI_VEC_FLAGS)
            .args(CLI_FLAGS)
            .arg(binary_path.to_string_lossy().to_string())
            .arg(source_path.to_string_lossy().to_string())
            .args(LINK_FLAGS)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackendError::Harness(anyhow!("could not run {}: {e}", self.compiler)))?;
        let clang_proc = wait_with_deadline(clang_child, deadline)?;

        if !clang_proc.status.success() {
            return Err(BackendError::Kernel(anyhow!(
                "Clang exited with {}\n{}",
                clang_proc.status,
                String::from_utf8_lossy(&clang_proc.stderr).into_owned()
            )));
        } else if !clang_proc.stderr.is_empty() {
            // We still want to see warnings.
            debug!("{}", String::from_utf8_lossy(&clang_proc.stderr));
        }

        let program = tree.program();
        Ok(ClangKernel {
            dir,
            binary_path,
            input_dtypes: program
                .buffers()
                .iter()
                .filter(|b| b.kind == BufferKind::Input)
                .map(|b| (b.name.clone(), b.dtype))
                .collect(),
            inputs_written: Mutex::new(false),
        })
    }
}

impl Backend for ClangBackend {
    type Kernel = ClangKernel;

    fn name(&self) -> &str {
        "clang"
    }

    fn build(
        &self,
        tree: &SyntaxTree,
        deadline: Option<Instant>,
    ) -> Result<ClangKernel, BackendError> {
        self.compile(tree, deadline)
    }

    fn measure(
        &self,
        kernel: &ClangKernel,
        inputs: &InputBuffers,
        runs: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<Duration>, BackendError> {
        kernel
            .write_inputs(inputs)
            .map_err(BackendError::Harness)?;
        kernel.run(runs, deadline)
    }
}

impl ClangKernel {
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Writes each input buffer to `<dir>/<name>.bin` in native byte order, once.
    fn write_inputs(&self, inputs: &InputBuffers) -> Result<()> {
        let mut written = self.inputs_written.lock();
        if *written {
            return Ok(());
        }
        for (name, dtype) in &self.input_dtypes {
            let Some(values) = inputs.get(name) else {
                bail!("missing input `{name}`");
            };
            let bytes = values
                .iter()
                .flat_map(|&v| match dtype {
                    Dtype::Float32 => (v as f32).to_ne_bytes().to_vec(),
                    Dtype::Float64 => v.to_ne_bytes().to_vec(),
                    Dtype::Int32 => (v as i32).to_ne_bytes().to_vec(),
                })
                .collect::<Vec<u8>>();
            std::fs::write(self.dir.path().join(format!("{name}.bin")), bytes)?;
        }
        *written = true;
        Ok(())
    }

    fn run(&self, runs: usize, deadline: Option<Instant>) -> Result<Vec<Duration>, BackendError> {
        let child = Command::new(&self.binary_path)
            .arg(runs.to_string())
            .arg(self.dir.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackendError::Harness(e.into()))?;
        let Output {
            status,
            stdout,
            stderr,
        } = wait_with_deadline(child, deadline)?;
        let stdout = String::from_utf8_lossy(&stdout);
        let stderr = String::from_utf8_lossy(&stderr);
        if !status.success() {
            return Err(BackendError::Kernel(anyhow!(
                "Failed to run the generated code: {status}\n{stderr}"
            )));
        }

        let times = stdout
            .lines()
            .filter(|line| line.starts_with("cpu:"))
            .map(parse_benchmark_output)
            .collect::<Result<Vec<_>>>()
            .map_err(BackendError::Harness)?;
        if times.len() != runs {
            return Err(BackendError::Harness(anyhow!(
                "expected {runs} timings, got {}",
                times.len()
            )));
        }
        Ok(times)
    }
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.map_or(false, |d| Instant::now() >= d)
}

/// Waits for `child` to exit, killing it once `deadline` passes. Piped stdout and
/// stderr are drained on reader threads while waiting, so a child writing more
/// than a pipe holds cannot stall.
fn wait_with_deadline(mut child: Child, deadline: Option<Instant>) -> Result<Output, BackendError> {
    let harness = |e: std::io::Error| BackendError::Harness(e.into());
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = loop {
        if let Some(status) = child.try_wait().map_err(harness)? {
            break status;
        }
        if past(deadline) {
            if let Err(e) = child.kill() {
                warn!("Failed to kill timed-out process: {e}");
            }
            child.wait().map_err(harness)?;
            return Err(BackendError::Timeout);
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    Ok(Output {
        status,
        stdout: collect_drained(stdout)?,
        stderr: collect_drained(stderr)?,
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<std::io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut bytes = Vec::new();
        pipe.read_to_end(&mut bytes)?;
        Ok(bytes)
    })
}

fn collect_drained(
    reader: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
) -> Result<Vec<u8>, BackendError> {
    let Some(reader) = reader else {
        return Ok(Vec::new());
    };
    reader
        .join()
        .map_err(|_| BackendError::Harness(anyhow!("output reader panicked")))?
        .map_err(|e| BackendError::Harness(e.into()))
}

fn parse_benchmark_output(output: &str) -> Result<Duration> {
    let mut outs = output.split_whitespace();
    if outs.next() != Some("cpu:") {
        bail!("expected \"cpu:\" prefix in benchmark output");
    }

    let s_str = outs
        .next()
        .ok_or("invalid output format")
        .map_err(Error::msg)?;
    let ns_str = outs
        .next()
        .ok_or("invalid output format")
        .map_err(Error::msg)?;
    if !s_str.ends_with('s') || !ns_str.ends_with("ns") {
        bail!("invalid time unit");
    }

    let s = s_str.trim_end_matches('s');
    let ns = ns_str.trim_end_matches("ns");
    Ok(Duration::new(s.parse::<u64>()?, ns.parse::<u32>()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{ExecutionConfig, ExecutionEvaluator, Evaluator, TimingReduction};
    use crate::program::library;

    #[test]
    fn test_parse_benchmark_output_valid_input() {
        assert_eq!(
            parse_benchmark_output("cpu: 10s 500ns").unwrap(),
            Duration::new(10, 500)
        );
        assert_eq!(
            parse_benchmark_output("cpu: 0s 1000000000ns").unwrap(),
            Duration::new(1, 0)
        );
        assert_eq!(
            parse_benchmark_output("cpu:   10s  500ns").unwrap(),
            Duration::new(10, 500)
        );
    }

    #[test]
    #[should_panic(expected = "expected \"cpu:\" prefix in benchmark output")]
    fn test_parse_benchmark_output_missing_cpu_prefix() {
        parse_benchmark_output("10s 500ns").unwrap();
    }

    #[test]
    #[should_panic(expected = "invalid time unit")]
    fn test_parse_benchmark_output_missing_time_unit() {
        parse_benchmark_output("cpu: 10 500").unwrap();
    }

    #[test]
    #[should_panic(expected = "invalid digit found in string")]
    fn test_parse_benchmark_output_negative_values() {
        parse_benchmark_output("cpu: -10s -500ns").unwrap();
    }

    #[test]
    #[should_panic(expected = "invalid output format")]
    fn test_parse_benchmark_output_missing_ns_part() {
        parse_benchmark_output("cpu: 10s").unwrap();
    }

    #[test]
    fn test_missing_compiler_is_a_harness_error() {
        let tree = SyntaxTree::from_program(library::producer_consumer(8).build().unwrap());
        let backend = ClangBackend::with_compiler("/nonexistent/clang");
        assert!(matches!(
            backend.build(&tree, None),
            Err(BackendError::Harness(_))
        ));
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    #[cfg(unix)]
    fn test_slow_compiler_is_killed_at_the_deadline() {
        let scripts = tempfile::tempdir().unwrap();
        let compiler = write_script(scripts.path(), "slowcc", "#!/bin/sh\nexec sleep 30\n");
        let backend = ClangBackend::with_compiler(compiler.to_string_lossy());
        let tree = SyntaxTree::from_program(library::producer_consumer(8).build().unwrap());

        let start = Instant::now();
        let deadline = start + Duration::from_millis(200);
        assert!(matches!(
            backend.build(&tree, Some(deadline)),
            Err(BackendError::Timeout)
        ));
        assert!(start.elapsed() < Duration::from_secs(10));

        let expired = Some(Instant::now());
        assert!(matches!(backend.build(&tree, expired), Err(BackendError::Timeout)));
    }

    #[test]
    #[cfg(unix)]
    fn test_kernel_output_larger_than_a_pipe_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let binary_path = write_script(
            dir.path(),
            "a.out",
            "#!/bin/sh\n\
             i=0\n\
             while [ \"$i\" -lt \"$1\" ]; do\n\
             echo \"cpu: 0s 1000ns\"\n\
             echo \"finished run $i\" >&2\n\
             i=$((i + 1))\n\
             done\n",
        );
        let kernel = ClangKernel {
            dir,
            binary_path,
            input_dtypes: vec![],
            inputs_written: Mutex::new(true),
        };
        let runs = 20_000;
        let deadline = Instant::now() + Duration::from_secs(120);
        let times = kernel.run(runs, Some(deadline)).unwrap();
        assert_eq!(times.len(), runs);
        assert!(times.iter().all(|t| *t == Duration::from_micros(1)));
    }

    #[test]
    fn test_clang_kernel_runs() {
        // Requires a compiler; skipped when CLANG is not set.
        let Ok(backend) = ClangBackend::new() else {
            return;
        };
        let program = library::matmul(16).build().unwrap();
        let inputs = InputBuffers::generate(&program, 0);
        let eval = ExecutionEvaluator::new(
            &program,
            backend,
            inputs,
            ExecutionConfig {
                runs: 2,
                reduction: TimingReduction::Min,
                timeout: None,
            },
        )
        .unwrap();
        let tree = SyntaxTree::from_program(program);
        let time = eval.evaluate(&tree).unwrap();
        assert!(time >= 0.0);
        let parallel = tree
            .derive(&crate::scheduling::Transformation::Parallelize { dim: "i_1".into() })
            .unwrap();
        assert!(eval.evaluate(&parallel).unwrap() >= 0.0);
    }
}
