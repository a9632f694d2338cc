//! The facade the presentation layer drives.
//!
//! Session mutations (imports, reference changes, project load/save,
//! cleanup) are only accepted while the scheduler is idle; while a stage
//! runs, its body is the only writer of per-row results.

use crate::annotation::AnnotationFeature;
use crate::error::PipelineError;
use crate::project::{ProjectSnapshot, ProjectStore};
use crate::reference::default_data_dir;
use crate::sample_set::SampleSet;
use crate::scheduler::{SchedulerState, TaskFailure, TaskId, TaskOutcome, TaskScheduler};
use crate::session::{CleanupReport, Session};
use crate::settings::PipelineSettings;
use crate::stages::{RdIndexCache, Stage, StageContext, StageReport};
use crate::tool_overrides::apply_tool_overrides;
use crate::tools::Toolkit;
use log::{info, warn};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, RwLock},
    time::Duration,
};

/// Stages of the composite run, in submission order.
pub const RUN_ALL_STAGES: [Stage; 3] = [Stage::Trim, Stage::Align, Stage::CallVariants];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReferenceChange {
    /// Samples already carry alignments made against the previous reference.
    pub stale_alignments: bool,
}

/// Why a composite run stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct RunAllFailure {
    pub stage: Stage,
    pub completed: Vec<StageReport>,
    pub failure: TaskFailure,
}

pub type RunAllOutcome = Result<Vec<StageReport>, RunAllFailure>;

type SharedProgress = Arc<Mutex<Box<dyn FnMut(&str) + Send>>>;
type DoneSlot = Arc<Mutex<Option<Box<dyn FnOnce(RunAllOutcome) + Send>>>>;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn finish(done: &DoneSlot, outcome: RunAllOutcome) {
    let callback = lock(done).take();
    if let Some(callback) = callback {
        callback(outcome);
    }
}

#[derive(Clone)]
pub struct Pipeline {
    session: Arc<Mutex<Session>>,
    scheduler: TaskScheduler<StageReport>,
    toolkit: Toolkit,
    settings: Arc<RwLock<PipelineSettings>>,
    rd_index: RdIndexCache,
}

impl Pipeline {
    pub fn new(toolkit: Toolkit, settings: PipelineSettings) -> Result<Self, PipelineError> {
        Ok(Self {
            session: Arc::new(Mutex::new(Session::default())),
            scheduler: TaskScheduler::new()?,
            toolkit,
            settings: Arc::new(RwLock::new(settings)),
            rd_index: Arc::new(Mutex::new(None)),
        })
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }

    fn ensure_idle(&self, action: &str) -> Result<(), PipelineError> {
        match self.scheduler.active_label() {
            Some(label) => Err(PipelineError::busy(format!(
                "Cannot {action} while '{label}' is running"
            ))),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn is_busy(&self) -> bool {
        self.scheduler.is_busy()
    }

    /// Delivers pending progress and completion callbacks.
    pub fn pump(&self) -> usize {
        self.scheduler.pump()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.scheduler.wait(timeout)
    }

    pub fn settings(&self) -> PipelineSettings {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_settings(&self, settings: PipelineSettings) -> Result<(), PipelineError> {
        settings.validate()?;
        let mut guard = match self.settings.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = settings;
        Ok(())
    }

    pub fn with_session<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        f(&self.session())
    }

    /// The persisted form of the session. Only taken while idle, so it never
    /// holds a half-written stage.
    pub fn snapshot(&self) -> Result<ProjectSnapshot, PipelineError> {
        self.ensure_idle("take a snapshot")?;
        Ok(self.session().snapshot())
    }

    pub fn add_samples(&self, filenames: &[PathBuf]) -> Result<usize, PipelineError> {
        self.ensure_idle("add files")?;
        let probe = self.toolkit.read_length.clone();
        Ok(self.session().samples.add(filenames, probe.as_ref()))
    }

    pub fn add_folder(&self, dir: &Path) -> Result<usize, PipelineError> {
        self.ensure_idle("add a folder")?;
        let files = SampleSet::files_in_folder(dir)?;
        if files.is_empty() {
            warn!("No FASTQ files found in '{}'", dir.display());
        }
        self.add_samples(&files)
    }

    pub fn merge_metadata(
        &self,
        table: &Path,
        local_key: &str,
        external_key: &str,
    ) -> Result<usize, PipelineError> {
        self.ensure_idle("merge metadata")?;
        self.session()
            .samples
            .merge_metadata(table, local_key, external_key)
    }

    pub fn set_output_dir(&self, dir: &Path) -> Result<(), PipelineError> {
        self.ensure_idle("change the output folder")?;
        fs::create_dir_all(dir).map_err(|e| {
            PipelineError::io(format!(
                "Could not create output folder '{}': {e}",
                dir.display()
            ))
        })?;
        info!("Output folder set to '{}'", dir.display());
        self.session().output_dir = Some(dir.to_path_buf());
        Ok(())
    }

    /// Changing the reference never deletes outputs; the returned flag tells
    /// the caller whether existing alignments were made against another one.
    pub fn set_reference(&self, path: &Path) -> Result<ReferenceChange, PipelineError> {
        self.ensure_idle("change the reference")?;
        if !path.exists() {
            return Err(PipelineError::invalid_input(format!(
                "Reference '{}' does not exist",
                path.display()
            )));
        }
        let mut session = self.session();
        let change = ReferenceChange {
            stale_alignments: !session.samples.bam_files().is_empty()
                && session.reference.sequence_path.as_deref() != Some(path),
        };
        if change.stale_alignments {
            warn!("Existing alignments were made against a different reference; re-run align");
        }
        session.reference.set_sequence(path.to_path_buf());
        Ok(change)
    }

    pub fn set_annotation(&self, path: &Path) -> Result<usize, PipelineError> {
        self.ensure_idle("change the annotation")?;
        let parser = self.toolkit.annotation_parser.clone();
        self.session()
            .reference
            .set_annotation(path.to_path_buf(), parser.as_ref())
    }

    pub fn apply_preset(
        &self,
        name: &str,
        data_dir: Option<&Path>,
    ) -> Result<ReferenceChange, PipelineError> {
        self.ensure_idle("change the reference")?;
        let data_dir = data_dir.map(Path::to_path_buf).unwrap_or_else(default_data_dir);
        let parser = self.toolkit.annotation_parser.clone();
        let mut session = self.session();
        let had_alignments = !session.samples.bam_files().is_empty();
        let previous = session.reference.sequence_path.clone();
        session
            .reference
            .apply_preset(name, &data_dir, parser.as_ref())?;
        Ok(ReferenceChange {
            stale_alignments: had_alignments && previous != session.reference.sequence_path,
        })
    }

    pub fn annotation_table(&self) -> Result<Vec<AnnotationFeature>, PipelineError> {
        let parser = self.toolkit.annotation_parser.clone();
        let mut session = self.session();
        Ok(session.reference.annotation_table(parser.as_ref())?.to_vec())
    }

    pub fn new_project(&self) -> Result<(), PipelineError> {
        self.ensure_idle("start a new project")?;
        self.session().new_project();
        Ok(())
    }

    /// Saves to `path`, or to the file the session was last saved to or
    /// loaded from.
    pub fn save_project(&self, path: Option<&Path>) -> Result<PathBuf, PipelineError> {
        self.ensure_idle("save the project")?;
        let mut session = self.session();
        let target = path
            .map(Path::to_path_buf)
            .or_else(|| session.project_file.clone())
            .ok_or_else(|| PipelineError::precondition("no project file chosen"))?;
        let written = ProjectStore::save(&session.snapshot(), &target)?;
        session.project_file = Some(written.clone());
        Ok(written)
    }

    /// Reads and validates the file first; the session is only replaced once
    /// that succeeded.
    pub fn load_project(&self, path: &Path) -> Result<(), PipelineError> {
        self.ensure_idle("load a project")?;
        let snapshot = ProjectStore::load(path)?;
        let loaded = Session::from_snapshot(snapshot, Some(path.to_path_buf()))?;
        *self.session() = loaded;
        Ok(())
    }

    pub fn cleanup(&self) -> Result<CleanupReport, PipelineError> {
        self.ensure_idle("clean up")?;
        self.session().cleanup()
    }

    /// Checks `stage`'s preconditions and hands its body to the scheduler.
    /// Both a failed precondition and a busy scheduler are reported here,
    /// synchronously; only faults of the body reach `on_done`.
    pub fn run_stage<P, D>(
        &self,
        stage: Stage,
        on_progress: P,
        on_done: D,
    ) -> Result<TaskId, PipelineError>
    where
        P: FnMut(&str) + Send + 'static,
        D: FnOnce(TaskOutcome<StageReport>) + Send + 'static,
    {
        let settings = self.settings();
        settings.validate()?;
        stage.check_preconditions(&self.session())?;
        apply_tool_overrides(&settings.tools);
        let ctx = StageContext {
            session: self.session.clone(),
            toolkit: self.toolkit.clone(),
            settings,
            rd_index: self.rd_index.clone(),
        };
        let id = self.scheduler.submit(
            stage.label(),
            move |progress| stage.run(&ctx, progress),
            on_progress,
            on_done,
        )?;
        info!("Submitted {stage} as task {id}");
        Ok(id)
    }

    /// Trim, then align, then call variants; each stage is submitted from the
    /// completion callback of the one before. The first failure, whether a
    /// fault or a precondition of a later stage, ends the run and is passed
    /// to `on_done`. If the first stage cannot be submitted the error is
    /// returned and `on_done` is dropped uncalled.
    pub fn run_all<P, D>(&self, on_progress: P, on_done: D) -> Result<TaskId, PipelineError>
    where
        P: FnMut(&str) + Send + 'static,
        D: FnOnce(RunAllOutcome) + Send + 'static,
    {
        let progress: SharedProgress = Arc::new(Mutex::new(Box::new(on_progress)));
        let done: DoneSlot = Arc::new(Mutex::new(Some(Box::new(on_done))));
        self.submit_chained(0, vec![], progress, done)
    }

    fn submit_chained(
        &self,
        idx: usize,
        completed: Vec<StageReport>,
        progress: SharedProgress,
        done: DoneSlot,
    ) -> Result<TaskId, PipelineError> {
        let stage = RUN_ALL_STAGES[idx];
        let next = self.clone();
        let stage_progress = progress.clone();
        self.run_stage(
            stage,
            move |message: &str| {
                let mut on_progress = lock(&stage_progress);
                (*on_progress)(message)
            },
            move |outcome: TaskOutcome<StageReport>| {
                let mut completed = completed;
                match outcome {
                    Err(failure) => finish(
                        &done,
                        Err(RunAllFailure {
                            stage,
                            completed,
                            failure,
                        }),
                    ),
                    Ok(report) => {
                        completed.push(report);
                        if idx + 1 == RUN_ALL_STAGES.len() {
                            finish(&done, Ok(completed));
                            return;
                        }
                        let so_far = completed.clone();
                        if let Err(err) =
                            next.submit_chained(idx + 1, completed, progress, done.clone())
                        {
                            warn!("Run-all stopped before {}: {err}", RUN_ALL_STAGES[idx + 1]);
                            finish(
                                &done,
                                Err(RunAllFailure {
                                    stage: RUN_ALL_STAGES[idx + 1],
                                    completed: so_far,
                                    failure: err.into(),
                                }),
                            );
                        }
                    }
                }
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::sample_set::TRIMMED;
    use crate::session::{
        CORE_FASTA, CSQ_MATRIX, CSQ_MATRIX_FILE, MAPPED_DIR, RAW_BCF, SNP_FILE, TRIMMED_DIR,
        VCF_FILE,
    };
    use crate::testing::{
        BlockingTrimmer, FakeTools, write_fastq, write_genbank_fixture, write_reference_fixture,
    };
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;
    use tempfile::tempdir;

    const WAIT: Option<Duration> = Some(Duration::from_secs(20));

    fn settings() -> PipelineSettings {
        PipelineSettings {
            threads: 1,
            ..PipelineSettings::default()
        }
    }

    fn pipeline(tools: &Arc<FakeTools>) -> Pipeline {
        Pipeline::new(tools.toolkit(), settings()).unwrap()
    }

    fn outcome_slot<T: Send + 'static>() -> (Arc<Mutex<Option<T>>>, impl FnOnce(T) + Send + 'static)
    {
        let slot = Arc::new(Mutex::new(None));
        let writer = slot.clone();
        (slot, move |value| *writer.lock().unwrap() = Some(value))
    }

    fn run_and_wait(p: &Pipeline, stage: Stage) -> StageReport {
        let (slot, on_done) = outcome_slot::<TaskOutcome<StageReport>>();
        p.run_stage(stage, |_| {}, on_done).unwrap();
        assert!(p.wait(WAIT));
        let outcome = slot.lock().unwrap().take().unwrap();
        outcome.unwrap()
    }

    #[test]
    fn test_align_gated_on_reference() {
        let td = tempdir().unwrap();
        let tools = Arc::new(FakeTools::default());
        let p = pipeline(&tools);
        p.add_samples(&[write_fastq(td.path(), "A.fastq")]).unwrap();
        p.set_output_dir(&td.path().join("out")).unwrap();

        let err = p.run_stage(Stage::Align, |_| {}, |_| {}).unwrap_err();
        assert_eq!(err.code, ErrorCode::Precondition);
        assert!(err.message.contains("reference genome"));
        assert_eq!(p.state(), SchedulerState::Idle);
        assert_eq!(tools.index_builds.load(Ordering::SeqCst), 0);

        let change = p.set_reference(&write_reference_fixture(td.path())).unwrap();
        assert!(!change.stale_alignments);
        let report = run_and_wait(&p, Stage::Align);
        assert_eq!(report.processed, 1);
        assert_eq!(tools.index_builds.load(Ordering::SeqCst), 1);

        let other = td.path().join("other.fa");
        fs::write(&other, ">x\nACGT\n").unwrap();
        assert!(p.set_reference(&other).unwrap().stale_alignments);
    }

    #[test]
    fn test_mutations_rejected_while_busy() {
        let td = tempdir().unwrap();
        let tools = Arc::new(FakeTools::default());
        let (release, gate) = mpsc::channel();
        let mut toolkit = tools.toolkit();
        toolkit.trimmer = Arc::new(BlockingTrimmer::new(gate));
        let p = Pipeline::new(toolkit, settings()).unwrap();
        p.add_samples(&[write_fastq(td.path(), "A.fastq")]).unwrap();
        p.set_output_dir(&td.path().join("out")).unwrap();

        let (slot, on_done) = outcome_slot::<TaskOutcome<StageReport>>();
        p.run_stage(Stage::Trim, |_| {}, on_done).unwrap();
        assert!(p.is_busy());

        let second = p.run_stage(Stage::Trim, |_| {}, |_| panic!("must not run"));
        assert_eq!(second.unwrap_err().code, ErrorCode::Busy);
        let err = p.add_samples(&[write_fastq(td.path(), "B.fastq")]).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);
        let err = p.save_project(Some(&td.path().join("p"))).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);
        assert_eq!(p.snapshot().unwrap_err().code, ErrorCode::Busy);
        assert_eq!(p.cleanup().unwrap_err().code, ErrorCode::Busy);
        assert_eq!(p.with_session(|s| s.samples.len()), 1);

        release.send(()).unwrap();
        assert!(p.wait(WAIT));
        assert!(slot.lock().unwrap().take().unwrap().is_ok());
        assert_eq!(p.add_samples(&[write_fastq(td.path(), "B.fastq")]).unwrap(), 1);
    }

    #[test]
    fn test_stage_fault_reported_through_on_done() {
        let td = tempdir().unwrap();
        let tools = Arc::new(FakeTools::default());
        tools.fail_variant_calling.store(true, Ordering::SeqCst);
        let p = pipeline(&tools);
        p.add_samples(&[write_fastq(td.path(), "A.fastq")]).unwrap();
        p.set_output_dir(&td.path().join("out")).unwrap();
        p.set_reference(&write_reference_fixture(td.path())).unwrap();
        p.set_annotation(&write_genbank_fixture(td.path())).unwrap();
        run_and_wait(&p, Stage::Align);

        let (slot, on_done) = outcome_slot::<TaskOutcome<StageReport>>();
        p.run_stage(Stage::CallVariants, |_| {}, on_done).unwrap();
        assert!(p.wait(WAIT));
        let failure = slot.lock().unwrap().take().unwrap().unwrap_err();
        assert_eq!(failure.code, ErrorCode::ExternalTool);
        assert!(failure.message.contains("bcftools"));
        assert_eq!(p.state(), SchedulerState::Idle);
        assert!(!p.with_session(|s| s.results.contains(VCF_FILE)));
    }

    #[test]
    fn test_project_round_trip_through_pipeline() {
        let td = tempdir().unwrap();
        let tools = Arc::new(FakeTools::default());
        let p = pipeline(&tools);
        p.add_samples(&[
            write_fastq(td.path(), "A.fastq"),
            write_fastq(td.path(), "B.fastq"),
        ])
        .unwrap();
        p.set_output_dir(&td.path().join("out")).unwrap();
        p.set_reference(&write_reference_fixture(td.path())).unwrap();
        run_and_wait(&p, Stage::Trim);
        let before = p.snapshot().unwrap();

        let saved = p.save_project(Some(&td.path().join("proj"))).unwrap();
        assert_eq!(saved.extension().unwrap(), "snpgenie");
        p.new_project().unwrap();
        assert_eq!(p.snapshot().unwrap(), ProjectSnapshot::default());

        // a broken file leaves the current session untouched
        p.add_samples(&[write_fastq(td.path(), "C.fastq")]).unwrap();
        let broken = td.path().join("broken.snpgenie");
        fs::write(&broken, "{}").unwrap();
        assert_eq!(
            p.load_project(&broken).unwrap_err().code,
            ErrorCode::Persistence
        );
        assert_eq!(p.with_session(|s| s.samples.len()), 1);

        p.load_project(&saved).unwrap();
        assert_eq!(p.snapshot().unwrap(), before);
        assert_eq!(p.with_session(|s| s.project_file.clone()), Some(saved.clone()));
        assert_eq!(p.save_project(None).unwrap(), saved);
    }

    #[test]
    fn test_end_to_end_two_samples() {
        let td = tempdir().unwrap();
        let root = td.path().join("run1");
        let tools = Arc::new(FakeTools::default());
        let p = pipeline(&tools);
        p.add_samples(&[
            write_fastq(td.path(), "A.fastq"),
            write_fastq(td.path(), "B.fastq"),
        ])
        .unwrap();
        p.set_output_dir(&root).unwrap();
        p.set_reference(&write_reference_fixture(td.path())).unwrap();
        p.set_annotation(&write_genbank_fixture(td.path())).unwrap();

        run_and_wait(&p, Stage::Trim);
        for name in ["A.fastq", "B.fastq"] {
            assert!(root.join(TRIMMED_DIR).join(name).exists());
        }
        p.with_session(|s| {
            assert!(s.samples.iter().all(|sample| sample.derived.contains_key(TRIMMED)));
        });

        run_and_wait(&p, Stage::Align);
        p.with_session(|s| {
            for sample in s.samples.iter() {
                let bam = sample.bam_file().unwrap();
                assert!(bam.starts_with(root.join(MAPPED_DIR)));
                assert!(bam.exists());
            }
        });

        run_and_wait(&p, Stage::CallVariants);
        let (vcf, csq) = p.with_session(|s| {
            (
                s.results.path(VCF_FILE).unwrap().to_path_buf(),
                s.results.path(CSQ_MATRIX).unwrap().to_path_buf(),
            )
        });
        assert!(vcf.starts_with(&root) && vcf.exists());
        assert!(csq.exists());

        let report = run_and_wait(&p, Stage::SnpAlignment);
        assert_eq!(report.processed, 1);
        let core = p.with_session(|s| s.results.path(SNP_FILE).unwrap().to_path_buf());
        assert_eq!(core, root.join(CORE_FASTA));

        let cleanup = p.cleanup().unwrap();
        assert!(!cleanup.removed.is_empty());
        assert_eq!(cleanup.forgotten, 4);
        p.with_session(|s| {
            assert!(s.samples.iter().all(|sample| sample.derived.is_empty()));
        });
        let err = p.run_stage(Stage::CallVariants, |_| {}, |_| {}).unwrap_err();
        assert_eq!(err.code, ErrorCode::Precondition);
        assert!(err.message.contains("run align first"));
        assert_eq!(fs::read_dir(root.join(TRIMMED_DIR)).unwrap().count(), 0);
        assert_eq!(fs::read_dir(root.join(MAPPED_DIR)).unwrap().count(), 0);
        assert!(!root.join(RAW_BCF).exists());
        assert!(root.join(CSQ_MATRIX_FILE).exists());
        assert!(root.join(CORE_FASTA).exists());
    }

    #[test]
    fn test_run_all_halts_when_align_not_ready() {
        let td = tempdir().unwrap();
        let tools = Arc::new(FakeTools::default());
        let p = pipeline(&tools);
        p.add_samples(&[write_fastq(td.path(), "A.fastq")]).unwrap();
        p.set_output_dir(&td.path().join("out")).unwrap();

        let messages = Arc::new(Mutex::new(vec![]));
        let m = messages.clone();
        let (slot, on_done) = outcome_slot::<RunAllOutcome>();
        p.run_all(move |msg| m.lock().unwrap().push(msg.to_string()), on_done)
            .unwrap();
        assert!(p.wait(WAIT));

        let failure = slot.lock().unwrap().take().unwrap().unwrap_err();
        assert_eq!(failure.stage, Stage::Align);
        assert_eq!(failure.failure.code, ErrorCode::Precondition);
        assert_eq!(failure.completed.len(), 1);
        assert_eq!(failure.completed[0].stage, Stage::Trim);
        assert_eq!(tools.trims.load(Ordering::SeqCst), 1);
        assert_eq!(tools.variant_calls.load(Ordering::SeqCst), 0);
        assert!(!messages.lock().unwrap().is_empty());
    }

    #[test]
    fn test_run_all_completes_three_stages() {
        let td = tempdir().unwrap();
        let tools = Arc::new(FakeTools::default());
        let p = pipeline(&tools);
        p.add_samples(&[write_fastq(td.path(), "A.fastq")]).unwrap();
        p.set_output_dir(&td.path().join("out")).unwrap();
        p.set_reference(&write_reference_fixture(td.path())).unwrap();
        p.set_annotation(&write_genbank_fixture(td.path())).unwrap();

        let (slot, on_done) = outcome_slot::<RunAllOutcome>();
        p.run_all(|_| {}, on_done).unwrap();
        assert!(p.wait(WAIT));
        let reports = slot.lock().unwrap().take().unwrap().unwrap();
        let stages: Vec<Stage> = reports.iter().map(|r| r.stage).collect();
        assert_eq!(stages, RUN_ALL_STAGES.to_vec());
        assert_eq!(tools.variant_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_all_first_stage_rejection_is_synchronous() {
        let tools = Arc::new(FakeTools::default());
        let p = pipeline(&tools);
        let called = Arc::new(Mutex::new(false));
        let c = called.clone();
        let err = p
            .run_all(|_| {}, move |_| *c.lock().unwrap() = true)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Precondition);
        assert!(!*called.lock().unwrap());
    }
}
