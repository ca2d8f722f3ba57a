use super::{
    endpoint::EndpointInner,
    transaction::{Transaction, TransactionState, TransactionStep, TransactionTimer},
};
use crate::{
    sip::{Request, Response},
    Error, Result,
};

pub(super) fn on_request(tx: &mut Transaction, _req: Request) -> TransactionStep {
    match (tx.state, &tx.last_response) {
        (TransactionState::Proceeding | TransactionState::Completed, Some(resp)) => {
            TransactionStep::send(resp.clone())
        }
        _ => TransactionStep::default(),
    }
}

pub(super) fn respond(
    tx: &mut Transaction,
    endpoint: &EndpointInner,
    resp: Response,
) -> Result<TransactionStep> {
    match tx.state {
        TransactionState::Trying | TransactionState::Proceeding => {
            let mut step = TransactionStep::send(resp.clone());
            if resp.is_provisional() {
                tx.state = TransactionState::Proceeding;
            } else {
                tx.state = TransactionState::Completed;
                if tx.reliable {
                    tx.state = TransactionState::Terminated;
                    step.terminated = true;
                } else {
                    let timer_j = endpoint.option.t1 * 64;
                    tx.arm_timeout(endpoint, TransactionTimer::TimerJ(tx.key.clone()), timer_j);
                }
            }
            tx.last_response = Some(resp);
            Ok(step)
        }
        state => Err(Error::TransactionError(
            format!("cannot send {} in {}", resp.status, state),
            tx.key.clone(),
        )),
    }
}

pub(super) fn on_timer(tx: &mut Transaction, timer: &TransactionTimer) -> TransactionStep {
    match (timer, tx.state) {
        (TransactionTimer::TimerJ(_), TransactionState::Completed) => {
            tx.state = TransactionState::Terminated;
            TransactionStep::terminate()
        }
        _ => TransactionStep::default(),
    }
}
