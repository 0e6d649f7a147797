pub mod cancel;
pub mod config;
pub mod convert;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metadata;
pub mod naming;
pub mod preprocess;
pub mod process;
pub mod progress;
pub mod report;
pub mod rules;
pub mod tasks;

pub use cancel::CancellationToken;
pub use config::{load_configuration, AppConfig};
pub use convert::{CommandConverter, ConversionOutput, ConversionRequest, Converter};
pub use discovery::{discover, Discovery, SessionFilter, SubjectSession};
pub use engine::{ConversionEngine, EngineOptions, RunResult};
pub use error::Error;
pub use executor::{Executor, ProgressHandle, ProgressSnapshot, TaskOutput};
pub use metadata::{MetadataReader, MetadataRecord, MetadataValue, RawSeries, SeriesScan};
pub use naming::{Normalizer, SessionIdentity, SessionLabel, SubjectLabel};
pub use preprocess::{CommandPreprocessor, PreprocessRequest, Preprocessor};
pub use progress::{ProgressReporter, SilentReporter};
pub use report::{FailureCause, Outcome, Report, ReportRecord, Stage};
pub use rules::{ClassificationRule, ClassifiedScan, RuleSet, ScanCategory};
pub use tasks::{build_tasks, Job, Task, TaskPlan, TaskState};
