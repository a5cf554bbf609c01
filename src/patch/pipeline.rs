//! Ordered, all-or-nothing application of patches.
//!
//! Patches run in registration order. The first failure stops the run: later patches are not
//! invoked and [`PatchPipeline::run_and_write`] does not touch the destination. A failed run
//! can leave earlier patches committed in the module, so a module whose run failed should be
//! dropped rather than written by other means.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use log::{error, info};
use rayon::prelude::*;

use crate::{
    module::{Module, ModuleLoader},
    patch::Patch,
    writer::ModuleWriter,
    Error, Result,
};

/// One applied patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Name of the patch
    pub patch: String,
    /// Time spent in [`Patch::apply`]
    pub elapsed: Duration,
}

/// Result of a successful pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Label of the patched module
    pub module: String,
    /// Applied patches, in order
    pub applied: Vec<PatchOutcome>,
    /// Where the module was written, if it was
    pub output: Option<PathBuf>,
}

impl PipelineReport {
    /// Names of the applied patches, in order
    #[must_use]
    pub fn patch_names(&self) -> Vec<&str> {
        self.applied.iter().map(|outcome| outcome.patch.as_str()).collect()
    }

    /// Time spent in all patches
    #[must_use]
    pub fn total_time(&self) -> Duration {
        self.applied.iter().map(|outcome| outcome.elapsed).sum()
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} patches applied in {:?}",
            self.module,
            self.applied.len(),
            self.total_time()
        )?;
        if let Some(output) = &self.output {
            write!(f, ", written to {}", output.display())?;
        }
        Ok(())
    }
}

/// An ordered list of patches, see the [module documentation](self).
#[derive(Default)]
pub struct PatchPipeline {
    patches: Vec<Box<dyn Patch>>,
}

impl PatchPipeline {
    /// An empty pipeline
    #[must_use]
    pub fn new() -> Self {
        PatchPipeline::default()
    }

    /// Append `patch`
    #[must_use]
    pub fn add_patch(mut self, patch: impl Patch + 'static) -> Self {
        self.patches.push(Box::new(patch));
        self
    }

    /// Append an already boxed patch
    pub fn push(&mut self, patch: Box<dyn Patch>) {
        self.patches.push(patch);
    }

    /// Number of patches
    #[must_use]
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// True if the pipeline has no patches
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Names of the patches, in order
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.patches.iter().map(|patch| patch.name())
    }

    /// Apply every patch to `module`, in order.
    ///
    /// # Errors
    /// Returns [`Error::PatchFailed`] for the first patch that fails; no later patch runs.
    pub fn run(&self, module: &mut Module) -> Result<PipelineReport> {
        let mut report = PipelineReport {
            module: module.label().to_string(),
            ..PipelineReport::default()
        };

        for patch in &self.patches {
            let name = patch.name();
            info!("Applying patch: {}", name);

            let start = Instant::now();
            if let Err(err) = patch.apply(module) {
                error!("  Failed to apply patch '{}': {}", name, err);
                return Err(Error::PatchFailed {
                    patch: name.to_string(),
                    source: Box::new(err),
                });
            }

            let elapsed = start.elapsed();
            info!("  Patch applied successfully ({:?}).", elapsed);
            report.applied.push(PatchOutcome {
                patch: name.to_string(),
                elapsed,
            });
        }

        Ok(report)
    }

    /// [`Self::run`], then write the module to `destination` with the default writer.
    ///
    /// Nothing is written unless every patch succeeded.
    ///
    /// # Errors
    /// Returns [`Error::PatchFailed`] or the error of [`ModuleWriter::write`].
    pub fn run_and_write(&self, module: &mut Module, destination: &Path) -> Result<PipelineReport> {
        self.run_and_write_with(module, destination, &ModuleWriter::new())
    }

    /// [`Self::run_and_write`] with a configured writer.
    ///
    /// # Errors
    /// Returns [`Error::PatchFailed`] or the error of [`ModuleWriter::write`].
    pub fn run_and_write_with(
        &self,
        module: &mut Module,
        destination: &Path,
        writer: &ModuleWriter,
    ) -> Result<PipelineReport> {
        let mut report = self.run(module)?;

        info!("Saving assembly to: {}", destination.display());
        writer.write(module, destination)?;
        report.output = Some(destination.to_path_buf());
        Ok(report)
    }

    /// Run the pipeline on independent modules in parallel.
    ///
    /// Every module gets its own run; the result at index `i` belongs to `modules[i]`.
    pub fn run_parallel(&self, modules: &mut [Module]) -> Vec<Result<PipelineReport>> {
        modules
            .par_iter_mut()
            .map(|module| self.run(module))
            .collect()
    }
}

impl fmt::Debug for PatchPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Load, patch and write one assembly file.
#[derive(Debug, Default)]
pub struct Patcher {
    loader: ModuleLoader,
    pipeline: PatchPipeline,
    writer: ModuleWriter,
}

impl Patcher {
    /// A patcher running `pipeline` with the default loader and writer
    #[must_use]
    pub fn new(pipeline: PatchPipeline) -> Self {
        Patcher {
            pipeline,
            ..Patcher::default()
        }
    }

    /// Add a dependency search directory
    #[must_use]
    pub fn search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.loader = self.loader.search_dir(dir);
        self
    }

    /// Use `writer` for the output
    #[must_use]
    pub fn writer(mut self, writer: ModuleWriter) -> Self {
        self.writer = writer;
        self
    }

    /// The pipeline
    #[must_use]
    pub fn pipeline(&self) -> &PatchPipeline {
        &self.pipeline
    }

    /// Patch `input` and write the result to `output`, which may be the same path.
    ///
    /// # Errors
    /// Returns the loading error, [`Error::PatchFailed`], or the writing error.
    pub fn patch_file(&self, input: &Path, output: &Path) -> Result<PipelineReport> {
        info!("Loading assembly...");
        let mut module = self.loader.load_file(input)?;
        info!("Loaded assembly: {}", module.name());

        self.pipeline
            .run_and_write_with(&mut module, output, &self.writer)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{
        builder::AssemblyBuilder,
        patch::{GameDebugLogPatch, StorePurchasePatch},
        test::{game_builder, game_module, unity_engine},
    };

    struct Counting {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Patch for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn apply(&self, _module: &mut Module) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::SymbolNotFound("type Missing".to_string()));
            }
            Ok(())
        }
    }

    fn counting(name: &'static str, calls: &Arc<AtomicUsize>, fail: bool) -> Counting {
        Counting {
            name,
            calls: Arc::clone(calls),
            fail,
        }
    }

    #[test]
    fn stops_at_first_failure() {
        let calls = [
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        ];
        let pipeline = PatchPipeline::new()
            .add_patch(counting("first", &calls[0], false))
            .add_patch(counting("second", &calls[1], true))
            .add_patch(counting("third", &calls[2], false));
        assert_eq!(pipeline.names().collect::<Vec<_>>(), ["first", "second", "third"]);

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("out.dll");
        let mut module = game_module();
        let result = pipeline.run_and_write(&mut module, &destination);

        match result {
            Err(Error::PatchFailed { patch, source }) => {
                assert_eq!(patch, "second");
                assert!(matches!(*source, Error::SymbolNotFound(_)));
            }
            other => panic!("unexpected result {other:?}"),
        }
        let counts: Vec<_> = calls.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(counts, [1, 1, 0]);
        assert!(!destination.exists());
    }

    #[test]
    fn applies_in_order_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("Assembly-CSharp.dll");
        let mut module = game_module();

        let report = PatchPipeline::new()
            .add_patch(StorePurchasePatch::default())
            .add_patch(GameDebugLogPatch::default())
            .run_and_write(&mut module, &destination)
            .unwrap();

        assert_eq!(
            report.patch_names(),
            ["Fix Store For Devices Without GMS", "GameDebug Log Implementation"]
        );
        assert_eq!(report.output.as_deref(), Some(destination.as_path()));
        assert!(report.to_string().contains("2 patches applied"));

        let written = Module::from_bytes_with(
            "patched",
            std::fs::read(&destination).unwrap(),
            Arc::clone(module.resolver()),
        )
        .unwrap();
        assert_eq!(written.bodies().len(), 0);
        assert_eq!(written.types().len(), module.types().len());
    }

    #[test]
    fn empty_pipeline_reports_nothing() {
        let mut module = game_module();
        let report = PatchPipeline::new().run(&mut module).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.module, "Assembly-CSharp.dll");
        assert!(!module.is_modified());
    }

    #[test]
    fn parallel_runs_are_independent() {
        let mut modules = vec![
            game_module(),
            Module::from_bytes("Plain.dll", AssemblyBuilder::new("Plain").build().unwrap()).unwrap(),
            game_module(),
        ];

        let results = PatchPipeline::new()
            .add_patch(StorePurchasePatch::default())
            .run_parallel(&mut modules);

        assert!(results[0].is_ok());
        assert!(matches!(
            &results[1],
            Err(Error::PatchFailed { patch, .. }) if patch == "Fix Store For Devices Without GMS"
        ));
        assert!(results[2].is_ok());
        assert!(modules[0].is_modified());
        assert!(!modules[1].is_modified());
        assert!(modules[2].is_modified());
    }

    #[test]
    fn patcher_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("UnityEngine.dll"), unity_engine()).unwrap();
        let input = dir.path().join("Assembly-CSharp.dll");
        std::fs::write(&input, game_builder().build().unwrap()).unwrap();
        let output = dir.path().join("patched").join("Assembly-CSharp.dll");
        std::fs::create_dir(dir.path().join("patched")).unwrap();

        let patcher = Patcher::new(
            PatchPipeline::new()
                .add_patch(GameDebugLogPatch::default())
                .add_patch(StorePurchasePatch::default()),
        );
        let report = patcher.patch_file(&input, &output).unwrap();
        assert_eq!(report.applied.len(), 2);
        assert!(output.is_file());
        assert_ne!(std::fs::read(&input).unwrap(), std::fs::read(&output).unwrap());
    }

    #[test]
    fn patcher_missing_input() {
        let patcher = Patcher::new(PatchPipeline::new());
        assert!(matches!(
            patcher.patch_file(Path::new("/nonexistent/Game.dll"), Path::new("/tmp/out.dll")),
            Err(Error::ContainerNotFound(_))
        ));
    }
}
