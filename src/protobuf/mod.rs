//! Generated protobuf modules
//!
//! build.rs compiles the Meshtastic device API definitions under `protos/`;
//! prost emits one file per package (meshtastic.rs).

pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types.
    //! The include is wrapped in a submodule with broad allow() attributes so the
    //! parts of the device API we do not touch stay quiet.
    #[allow(dead_code, unused_imports, unused_variables, unused_mut, unused_macros)]
    #[allow(clippy::all)]
    #[allow(rustdoc::invalid_html_tags)]
    mod inner {
        include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
    }
    pub use inner::*;
}
