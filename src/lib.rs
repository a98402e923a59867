pub mod config;
pub mod error;
pub mod state;
pub mod db;
pub mod routes;

pub mod crypto {
    pub mod aes;
    pub mod token;
}

pub mod models {
    pub mod attendance;
    pub mod events;
    pub mod session;
    pub mod token;
}

pub mod storage {
    pub mod memory;
    pub mod token_store;
}

pub mod events {
    pub mod bus;
    pub mod memory;
}

pub mod repositories {
    pub mod attendance;
    pub mod memory;
}

pub mod services {
    pub mod attendance;
    pub mod control;
    pub mod generator;
    pub mod sessions;
    pub mod validation;
    pub mod verification;
}

pub mod handlers {
    pub mod attendance;
    pub mod classes;
    pub mod response;
    pub mod scan;
}
