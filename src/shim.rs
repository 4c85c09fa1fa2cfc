#![allow(unused_imports)]

#[cfg(not(feature = "shuttle"))]
pub(crate) use std::{sync, thread};

#[cfg(feature = "shuttle")]
pub(crate) use shuttle::{sync, thread};
