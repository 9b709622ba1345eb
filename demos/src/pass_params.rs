//! Cost of passing arguments to a non-inlined call.

use forkbench::prelude::*;
use std::hint::black_box;

/// Three heap objects per worker thread
pub struct Objects {
    a: Box<u64>,
    b: Box<u64>,
    c: Box<u64>,
}

impl Fixture for Objects {
    const SCOPE: Scope = Scope::Thread;

    fn setup(_: &Params) -> Result<Self, FixtureError> {
        Ok(Objects {
            a: Box::new(1),
            b: Box::new(2),
            c: Box::new(3),
        })
    }
}

#[inline(never)]
fn invoke_0() -> i32 {
    1
}

#[inline(never)]
fn invoke_1(_a: &u64) -> i32 {
    1
}

#[inline(never)]
fn invoke_3(_a: &u64, _b: &u64, _c: &u64) -> i32 {
    1
}

#[inline(never)]
fn invoke_6(_a: &u64, _b: &u64, _c: &u64, _d: &u64, _e: &u64, _f: &u64) -> i32 {
    1
}

#[forkbench::bench(id = "pass_params::base", group = "pass_params", mode = "thrpt", unit = "s", warmup = 5, iterations = 3)]
fn base() -> i32 {
    invoke_0()
}

#[forkbench::bench(id = "pass_params::one", group = "pass_params", mode = "thrpt", unit = "s", warmup = 5, iterations = 3)]
fn one_parameter(objects: &Objects) -> i32 {
    invoke_1(black_box(&objects.a))
}

#[forkbench::bench(id = "pass_params::three", group = "pass_params", mode = "thrpt", unit = "s", warmup = 5, iterations = 3)]
fn three_parameters(objects: &Objects) -> i32 {
    let o = black_box(objects);
    invoke_3(&o.a, &o.b, &o.c)
}

#[forkbench::bench(id = "pass_params::six", group = "pass_params", mode = "thrpt", unit = "s", warmup = 5, iterations = 3)]
fn six_parameters(objects: &Objects) -> i32 {
    let o = black_box(objects);
    invoke_6(&o.a, &o.b, &o.c, &o.a, &o.b, &o.c)
}
