pub mod archive;
pub mod arcvec;
pub mod backup_config;
pub mod cancel;
pub mod classify;
pub mod executor;
pub mod job;
pub mod lock;
pub mod notifications;
pub mod probe;
pub mod redacted;
pub mod report;
pub mod result_error;
pub mod scheduler;
pub mod snapshot;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
