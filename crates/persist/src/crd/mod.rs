pub mod common;
pub mod cron;
pub mod notebook;
pub mod training;
pub mod user;

pub use common::*;
pub use cron::{Cron, CronHistory, CronSpec, CronStatus};
pub use notebook::{Notebook, NotebookSpec, NotebookStatus};
pub use training::{
    MPIJob, MPIJobSpec, PyTorchJob, PyTorchJobSpec, TFJob, TFJobSpec, XDLJob, XDLJobSpec,
    XGBoostJob, XGBoostJobSpec,
};
pub use user::{User, UserSpec};
