/// Verify that all modules are accessible from the crate root.
/// Each `use` statement will cause a compile error if the module is missing.

#[allow(unused_imports)]
use stomp_load_test::accounts;
#[allow(unused_imports)]
use stomp_load_test::cli;
#[allow(unused_imports)]
use stomp_load_test::config;
#[allow(unused_imports)]
use stomp_load_test::connection;
#[allow(unused_imports)]
use stomp_load_test::directory;
#[allow(unused_imports)]
use stomp_load_test::error;
#[allow(unused_imports)]
use stomp_load_test::metrics;
#[allow(unused_imports)]
use stomp_load_test::reporter;
#[allow(unused_imports)]
use stomp_load_test::scheduler;
#[allow(unused_imports)]
use stomp_load_test::session;
#[allow(unused_imports)]
use stomp_load_test::stats;
#[allow(unused_imports)]
use stomp_load_test::stomp;
#[allow(unused_imports)]
use stomp_load_test::tracker;
#[allow(unused_imports)]
use stomp_load_test::transport;

#[test]
fn all_modules_are_accessible() {
    // stomp should also expose parser, formatter, message and frame submodules.
    let _ = stomp_load_test::stomp::parser::is_heartbeat("\n");
    let _ = stomp_load_test::stomp::formatter::room_destination(1);
    let _ = stomp_load_test::stomp::message::key_prefix(1);
    let _ = stomp_load_test::stomp::frame::Command::Send;
    assert!(stomp_load_test::metrics::build_recorder().is_ok());
}

#[test]
fn cargo_toml_defines_load_test_binary() {
    let cargo_toml = std::fs::read_to_string("Cargo.toml").expect("Failed to read Cargo.toml");
    assert!(
        cargo_toml.contains("name = \"stomp-load-test\""),
        "Cargo.toml should define the stomp-load-test binary"
    );
    assert!(
        cargo_toml.contains("path = \"src/main.rs\""),
        "Cargo.toml should specify path for the binary"
    );
}
