//! forkbench Demos
//!
//! One benchmark binary hosting the demo workloads. Run it like any
//! forkbench binary:
//!
//! ```sh
//! cargo run -p forkbench-demos --release -- '^codec' -p byte.size=1048576 --prof alloc
//! ```
//!
//! | Module | Workload | Mode |
//! |--------|----------|------|
//! | `pass_params` | Calls with 0, 1, 3 and 6 arguments | thrpt |
//! | `executor` | Task dispatch: rayon pool vs crossbeam-channel fixed pool | avgt |
//! | `codec` | Run-length block codec over `byte.size` inputs | avgt, ms |

mod codec;
mod executor;
mod pass_params;

#[global_allocator]
static GLOBAL: forkbench::TrackingAllocator = forkbench::TrackingAllocator;

fn main() {
    if let Err(e) = forkbench::run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
