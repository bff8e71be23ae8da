use crate::transaction::Transaction;
use crate::wallet::Identity;

/// Replays settled history for one account. Outputs credit, inputs debit
/// their amount plus the fee. A fee is only credited to a miner once an
/// explicit fee-transfer transaction has itself been settled.
pub fn balance<'a, I>(identity: &Identity, history: I) -> i128
where
    I: IntoIterator<Item = &'a Transaction>,
{
    history.into_iter().fold(0i128, |acc, tx| {
        let mut acc = acc;
        if tx.output.is_to(identity) {
            acc += i128::from(tx.output.amount);
        }
        if let Some(input) = &tx.input {
            if input.is_from(identity) {
                acc -= i128::from(input.amount) + i128::from(tx.fee);
            }
        }
        acc
    })
}

/// What `identity` can still spend: settled balance minus everything it
/// already has queued in `pending`. Pending credits are not counted.
pub fn available<'a, I>(identity: &Identity, settled: &'a [Transaction], pending: I) -> i128
where
    I: IntoIterator<Item = &'a Transaction>,
{
    let queued = pending
        .into_iter()
        .filter(|tx| tx.sender() == Some(identity));
    balance(identity, settled.iter().chain(queued))
}
