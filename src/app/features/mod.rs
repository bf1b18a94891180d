pub mod bloatware;
pub mod configurator;
pub mod installer;
pub mod policy;
