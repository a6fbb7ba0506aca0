use crate::cp::group::{GroupResponse, RequestId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Responses to each endpoint's most recent calls. Call ids only grow per endpoint, so the
/// oldest response is always the first to go.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ResponseWindow {
    capacity: usize,
    responses: BTreeMap<Uuid, BTreeMap<u64, GroupResponse>>,
}

impl ResponseWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        ResponseWindow {
            capacity,
            responses: BTreeMap::new(),
        }
    }

    pub(crate) fn get(&self, request: &RequestId) -> Option<&GroupResponse> {
        self.responses
            .get(&request.endpoint)
            .and_then(|window| window.get(&request.call_id))
    }

    pub(crate) fn record(&mut self, request: RequestId, response: GroupResponse) {
        let window = self.responses.entry(request.endpoint).or_insert_with(BTreeMap::new);
        window.insert(request.call_id, response);
        while window.len() > self.capacity {
            let oldest = match window.keys().next() {
                Some(call_id) => *call_id,
                None => break,
            };
            window.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cp::group::Value;

    #[test]
    fn keeps_most_recent_calls() {
        let mut window = ResponseWindow::new(2);
        let endpoint = Uuid::new_v4();
        let request = |call_id| RequestId { endpoint, call_id };

        window.record(request(1), Ok(Value::Long(1)));
        window.record(request(2), Ok(Value::Long(2)));
        window.record(request(3), Ok(Value::Long(3)));

        assert_eq!(window.get(&request(1)), None);
        assert_eq!(window.get(&request(2)), Some(&Ok(Value::Long(2))));
        assert_eq!(window.get(&request(3)), Some(&Ok(Value::Long(3))));

        let other = RequestId {
            endpoint: Uuid::new_v4(),
            call_id: 1,
        };
        assert_eq!(window.get(&other), None);
    }
}
