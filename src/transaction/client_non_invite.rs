use super::{
    endpoint::EndpointInner,
    transaction::{Transaction, TransactionState, TransactionStep, TransactionTimer},
};
use crate::sip::Response;
use std::cmp::min;

pub(super) fn start(tx: &mut Transaction, endpoint: &EndpointInner) -> TransactionStep {
    let t1 = endpoint.option.t1;
    if !tx.reliable {
        tx.interval = t1;
        tx.arm_retransmit(endpoint, TransactionTimer::TimerE(tx.key.clone()));
    }
    tx.arm_timeout(endpoint, TransactionTimer::TimerF(tx.key.clone()), t1 * 64);
    TransactionStep::send(tx.original.clone())
}

pub(super) fn on_response(
    tx: &mut Transaction,
    endpoint: &EndpointInner,
    resp: Response,
) -> TransactionStep {
    match tx.state {
        TransactionState::Trying | TransactionState::Proceeding => {
            let mut step = TransactionStep::default();
            if resp.is_provisional() {
                tx.state = TransactionState::Proceeding;
            } else {
                tx.cancel_timers(endpoint);
                tx.state = TransactionState::Completed;
                if tx.reliable {
                    step.terminated = true;
                } else {
                    let timer_k = endpoint.option.t4;
                    tx.arm_timeout(endpoint, TransactionTimer::TimerK(tx.key.clone()), timer_k);
                }
            }
            tx.last_response = Some(resp.clone());
            step.deliver = Some(resp);
            step
        }
        _ => TransactionStep::default(),
    }
}

pub(super) fn on_timer(
    tx: &mut Transaction,
    endpoint: &EndpointInner,
    timer: &TransactionTimer,
) -> TransactionStep {
    match (timer, tx.state) {
        (TransactionTimer::TimerE(key), TransactionState::Trying) => {
            tx.interval = min(tx.interval * 2, endpoint.option.t2);
            tx.arm_retransmit(endpoint, TransactionTimer::TimerE(key.clone()));
            TransactionStep::send(tx.original.clone())
        }
        (TransactionTimer::TimerE(key), TransactionState::Proceeding) => {
            tx.interval = endpoint.option.t2;
            tx.arm_retransmit(endpoint, TransactionTimer::TimerE(key.clone()));
            TransactionStep::send(tx.original.clone())
        }
        (TransactionTimer::TimerF(_), TransactionState::Trying | TransactionState::Proceeding) => {
            tx.cancel_timers(endpoint);
            tx.timeout_response()
        }
        (TransactionTimer::TimerK(_), TransactionState::Completed) => {
            tx.cancel_timers(endpoint);
            tx.state = TransactionState::Terminated;
            TransactionStep::terminate()
        }
        _ => TransactionStep::default(),
    }
}
