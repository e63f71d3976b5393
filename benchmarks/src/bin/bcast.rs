use std::process;
use clap::Parser;
use log::error;
use procgroup::{MpiGroup, ProcessGroup, ThreadLevel};
use benchmarks::{bcast, bcast_local, print_bcast, BcastArgs, BcastOptions};

fn run(args: &BcastArgs, opts: &BcastOptions) -> benchmarks::Result<()> {
    if args.local {
        let stats = bcast_local(opts, args.ranks)?;
        return print_bcast(&stats, opts.full);
    }
    let group = MpiGroup::init(ThreadLevel::Single)?;
    let result = bcast(&group, opts).and_then(|stats| {
        if group.rank() == 0 {
            print_bcast(&stats, opts.full)?;
        }
        Ok(())
    });
    if let Err(e) = result {
        if !e.is_configuration() || group.rank() == 0 {
            error!("rank {}: {}", group.rank(), e);
        }
        group.abort(1);
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = BcastArgs::parse();
    if let Err(e) = args.options().and_then(|opts| run(&args, &opts)) {
        error!("{}", e);
        process::exit(1);
    }
}
