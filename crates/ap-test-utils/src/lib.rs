// ap-test-utils: Shared test utilities for the control plane suite.
//
// Provides a mock agent node and a mock webhook sink for integration
// testing of the execution controller and observability forwarder.

pub mod mock_agent;
pub mod mock_webhook;

pub use mock_agent::{AgentResponse, MockAgentServer, ReceivedDispatch};
pub use mock_webhook::{MockWebhookSink, ReceivedDelivery};
