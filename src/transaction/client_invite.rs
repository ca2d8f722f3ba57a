use super::{
    endpoint::EndpointInner,
    message::{make_ack_for_failure, make_cancel},
    transaction::{Transaction, TransactionState, TransactionStep, TransactionTimer},
};
use crate::sip::{Request, Response};
use tracing::debug;

pub(super) fn start(tx: &mut Transaction, endpoint: &EndpointInner) -> TransactionStep {
    let t1 = endpoint.option.t1;
    if !tx.reliable {
        tx.interval = t1;
        tx.arm_retransmit(endpoint, TransactionTimer::TimerA(tx.key.clone()));
    }
    tx.arm_timeout(endpoint, TransactionTimer::TimerB(tx.key.clone()), t1 * 64);
    TransactionStep::send(tx.original.clone())
}

pub(super) fn on_response(
    tx: &mut Transaction,
    endpoint: &EndpointInner,
    resp: Response,
) -> TransactionStep {
    match tx.state {
        TransactionState::Calling | TransactionState::Proceeding => {
            let mut step = TransactionStep::default();
            if resp.is_provisional() {
                if tx.cancel_sent {
                    tx.cancel_retransmit(endpoint);
                } else {
                    tx.cancel_timers(endpoint);
                }
                tx.state = TransactionState::Proceeding;
                if tx.cancel_pending {
                    tx.cancel_pending = false;
                    step.cancel = Some(send_cancel(tx, endpoint));
                }
            } else if resp.is_success() {
                tx.cancel_timers(endpoint);
                tx.cancel_pending = false;
                tx.state = TransactionState::Accepted;
                let timer_m = endpoint.option.t1 * 64;
                tx.arm_timeout(endpoint, TransactionTimer::TimerM(tx.key.clone()), timer_m);
            } else {
                tx.cancel_timers(endpoint);
                tx.cancel_pending = false;
                tx.state = TransactionState::Completed;
                let ack = make_ack_for_failure(&tx.original, &resp);
                step.send.push(ack.clone().into());
                tx.last_ack = Some(ack);
                if tx.reliable {
                    step.terminated = true;
                } else {
                    let timer_d = endpoint.option.t1 * 64;
                    tx.arm_timeout(endpoint, TransactionTimer::TimerD(tx.key.clone()), timer_d);
                }
            }
            tx.last_response = Some(resp.clone());
            step.deliver = Some(resp);
            step
        }
        // 2xx retransmissions reach the dialog so it can ACK again
        TransactionState::Accepted if resp.is_success() => TransactionStep {
            deliver: Some(resp),
            ..Default::default()
        },
        TransactionState::Completed if resp.is_final() && !resp.is_success() => {
            match &tx.last_ack {
                Some(ack) => TransactionStep::send(ack.clone()),
                None => TransactionStep::default(),
            }
        }
        _ => {
            debug!(key = %tx.key, status = resp.status, "response ignored in {}", tx.state);
            TransactionStep::default()
        }
    }
}

/// CANCEL waits for the first provisional response.
pub(super) fn cancel(tx: &mut Transaction, endpoint: &EndpointInner) -> TransactionStep {
    match tx.state {
        TransactionState::Calling => {
            tx.cancel_pending = true;
            TransactionStep::default()
        }
        TransactionState::Proceeding if !tx.cancel_sent => TransactionStep {
            cancel: Some(send_cancel(tx, endpoint)),
            ..Default::default()
        },
        _ => TransactionStep::default(),
    }
}

/// A cancelled INVITE that never gets its final response ends after
/// 64*T1 with a 408 (RFC 3261 9.1).
fn send_cancel(tx: &mut Transaction, endpoint: &EndpointInner) -> Request {
    tx.cancel_sent = true;
    let timeout = endpoint.option.t1 * 64;
    tx.arm_timeout(endpoint, TransactionTimer::TimerB(tx.key.clone()), timeout);
    make_cancel(&tx.original)
}

pub(super) fn on_timer(
    tx: &mut Transaction,
    endpoint: &EndpointInner,
    timer: &TransactionTimer,
) -> TransactionStep {
    match (timer, tx.state) {
        (TransactionTimer::TimerA(key), TransactionState::Calling) => {
            tx.interval *= 2;
            tx.arm_retransmit(endpoint, TransactionTimer::TimerA(key.clone()));
            TransactionStep::send(tx.original.clone())
        }
        (TransactionTimer::TimerB(_), TransactionState::Calling)
        | (TransactionTimer::TimerB(_), TransactionState::Proceeding) => {
            tx.cancel_timers(endpoint);
            tx.timeout_response()
        }
        (TransactionTimer::TimerD(_), TransactionState::Completed)
        | (TransactionTimer::TimerM(_), TransactionState::Accepted) => {
            tx.cancel_timers(endpoint);
            tx.state = TransactionState::Terminated;
            TransactionStep::terminate()
        }
        _ => TransactionStep::default(),
    }
}
