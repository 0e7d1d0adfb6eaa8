pub mod error;

// data module
pub mod data {
    pub mod signal;
    pub mod event;
    pub mod io;
}

// algorithm module
pub mod algorithm {
    pub mod baseline;
    pub mod threshold;
    pub mod response;
    pub mod levenberg;
    pub mod fit;
}

// analysis module
pub mod analysis {
    pub mod config;
    pub mod observables;
    pub mod aggregator;
    pub mod selection;
}
