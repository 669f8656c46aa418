//! Device drivers

pub mod ra8875;
pub mod sdmmc;
