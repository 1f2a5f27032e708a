mod scheduled;

pub use scheduled::{
    RefreshJobContext, RefreshTick, build_refresh_monitor, process_refresh_job, warm_endpoints,
};
