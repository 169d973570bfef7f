#![allow(dead_code)]

pub mod ops;
pub mod rig;
