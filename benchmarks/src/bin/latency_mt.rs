use std::process;
use std::sync::Arc;
use clap::Parser;
use log::error;
use procgroup::{MpiGroup, ProcessGroup, ThreadLevel};
use threading::{Backend, OsThreads, Tasklets};
use benchmarks::{
    latency_mt,
    latency_mt_local,
    BackendKind,
    Error,
    LatencyMtArgs,
    LatencyMtOptions,
    StdoutReporter,
};

fn run<B: Backend>(local: bool, opts: &LatencyMtOptions) -> benchmarks::Result<()> {
    let reporter = Arc::new(StdoutReporter::new(B::NAME));
    if local {
        return latency_mt_local::<B>(opts, reporter);
    }
    let group = Arc::new(MpiGroup::init(ThreadLevel::Multiple)?);
    if let Err(e) = latency_mt::<B, _>(group.clone(), opts, reporter) {
        if matches!(e, Error::ThreadLevel) {
            if group.rank() == 0 {
                error!("{} (granted {:?})", e, group.provided());
            }
        } else if !e.is_configuration() || group.rank() == 0 {
            error!("rank {}: {}", group.rank(), e);
        }
        group.abort(1);
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = LatencyMtArgs::parse();
    let result = args.options().and_then(|opts| match args.backend {
        BackendKind::Threads => run::<OsThreads>(args.local, &opts),
        BackendKind::Tasklets => run::<Tasklets>(args.local, &opts),
    });
    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}
