pub mod startup_banner;
pub mod timing;
