// gw-test-utils: Shared test utilities for the gateway suites.
//
// Provides a scripted mock command server (the HTTP RPC backend the
// gateway authenticates against) and a small WebSocket client for driving
// a running gateway end-to-end.

pub mod mock_command_server;
pub mod ws_client;

pub use mock_command_server::MockCommandServer;
pub use ws_client::TestWsClient;
