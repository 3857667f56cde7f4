mod common;

use bigdecimal::{BigDecimal, Zero};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;

use ledger_core::domain::{AssetKey, LedgerError, TransactionType, UserAsset};
use ledger_core::ports::LedgerStore;
use ledger_core::services::ledger::{
    AdjustRequest, DepositRequest, EntryRequest, GameRequest, RefundRequest,
};
use ledger_core::services::AssetLedgerService;

const USER: &str = "player-1";
const CURRENCY: &str = "USDT";

fn amount(rng: &mut StdRng) -> String {
    let cents: u32 = rng.gen_range(1..=5_000);
    format!("{}.{:02}", cents / 100, cents % 100)
}

fn entry(amount: String) -> EntryRequest {
    EntryRequest {
        user_id: USER.to_string(),
        currency: CURRENCY.to_string(),
        amount,
        reference_id: None,
        description: None,
        metadata: None,
    }
}

fn game(amount: String, game_id: String) -> GameRequest {
    GameRequest {
        user_id: USER.to_string(),
        currency: CURRENCY.to_string(),
        amount,
        game_id,
        description: None,
    }
}

fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

async fn random_op(ledger: &AssetLedgerService, rng: &mut StdRng) -> Result<(), LedgerError> {
    let game_id = format!("round-{}", rng.gen_range(0..6));
    let value = amount(rng);

    let result = match rng.gen_range(0..9) {
        0 | 1 => {
            let bonus_rate = if rng.gen_bool(0.3) { Some("0.15".to_string()) } else { None };
            ledger.deposit(DepositRequest { entry: entry(value), bonus_rate }).await
        }
        2 => ledger.withdraw(entry(value)).await,
        3 => ledger.bet(game(value, game_id)).await,
        4 => ledger.win(game(value, game_id)).await,
        5 => {
            ledger
                .refund(RefundRequest {
                    user_id: USER.to_string(),
                    currency: CURRENCY.to_string(),
                    game_id,
                    description: None,
                })
                .await
        }
        6 => ledger.lock_balance(entry(value)).await,
        7 => ledger.unlock_balance(entry(value)).await,
        _ => {
            let signed = if rng.gen_bool(0.5) { format!("-{}", value) } else { value };
            ledger
                .adjust(AdjustRequest {
                    user_id: USER.to_string(),
                    currency: CURRENCY.to_string(),
                    amount: signed,
                    operator_id: "ops-1".to_string(),
                    description: Some("randomized".to_string()),
                })
                .await
        }
    };
    result.map(|_| ())
}

fn assert_row_invariants(asset: &UserAsset) {
    let zero = BigDecimal::zero();
    assert!(asset.balance_real >= zero, "real went negative: {}", asset.balance_real);
    assert!(asset.balance_bonus >= zero, "bonus went negative: {}", asset.balance_bonus);
    assert!(asset.balance_locked >= zero, "locked went negative: {}", asset.balance_locked);
    assert!(asset.balance_locked <= asset.total(), "locked {} exceeds total {}", asset.balance_locked, asset.total());
}

#[tokio::test]
async fn test_random_operations_preserve_invariants_and_replay() {
    for seed in [7_u64, 42, 1337] {
        let store = common::store();
        let ledger = AssetLedgerService::new(store.clone());
        let key = AssetKey::new(USER, CURRENCY).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);

        for _ in 0..300 {
            let before = store.get_asset(&key).await.unwrap();
            let before_len = store.history_for_replay(&key).await.unwrap().len();

            match random_op(&ledger, &mut rng).await {
                Ok(()) => {}
                Err(e) => {
                    // a rejected operation changes nothing
                    assert!(
                        e.is_insufficient_funds()
                            || matches!(
                                e,
                                LedgerError::InvalidUnlockAmount { .. }
                                    | LedgerError::BetNotFound(_)
                                    | LedgerError::InvariantViolation(_)
                            ),
                        "unexpected rejection: {:?}",
                        e
                    );
                    assert_eq!(store.get_asset(&key).await.unwrap(), before);
                    assert_eq!(store.history_for_replay(&key).await.unwrap().len(), before_len);
                }
            }

            if let Some(asset) = store.get_asset(&key).await.unwrap() {
                assert_row_invariants(&asset);
            }
        }

        let history = store.history_for_replay(&key).await.unwrap();
        let asset = store.get_asset(&key).await.unwrap().unwrap();

        let mut running = BigDecimal::zero();
        for pair in history.windows(2) {
            assert_eq!(pair[1].balance_before, pair[0].balance_after, "snapshot chain broken at seq {}", pair[1].seq);
            assert!(pair[1].seq > pair[0].seq);
        }
        for tx in &history {
            assert_eq!(tx.balance_after, &tx.balance_before + tx.signed_amount());
            assert!(tx.amount > BigDecimal::zero());
            running += tx.signed_amount();
        }
        assert_eq!(running, asset.available());

        let report = ledger.reconcile(USER, CURRENCY).await.unwrap();
        assert!(report.matches, "seed {} does not replay", seed);
        assert_eq!(report.transactions, history.len());
    }
}

#[tokio::test]
async fn test_concurrent_bets_never_overdraw() {
    let store = common::store();
    let ledger = AssetLedgerService::new(store.clone());
    ledger
        .deposit(DepositRequest { entry: entry("100".to_string()), bonus_rate: None })
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..50 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.bet(game("3".to_string(), format!("g-{}", i))).await
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert!(e.is_insufficient_funds(), "unexpected error {:?}", e),
        }
    }

    assert_eq!(accepted, 33);
    let balance = ledger.get_balance(USER, CURRENCY).await.unwrap();
    assert_eq!(dec(&balance.real), dec("1"));

    let key = AssetKey::new(USER, CURRENCY).unwrap();
    let history = store.history_for_replay(&key).await.unwrap();
    let bets = history.iter().filter(|tx| tx.tx_type == TransactionType::GameBet).count();
    assert_eq!(bets, 33);
}

#[tokio::test]
async fn test_bonus_is_spent_first_and_never_withdrawn() {
    let ledger = AssetLedgerService::new(common::store());
    ledger
        .deposit(DepositRequest { entry: entry("10".to_string()), bonus_rate: Some("0.5".to_string()) })
        .await
        .unwrap();

    let err = ledger.withdraw(entry("12".to_string())).await.unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientWithdrawableBalance { .. }));

    ledger.bet(game("7".to_string(), "g-1".to_string())).await.unwrap();
    let balance = ledger.get_balance(USER, CURRENCY).await.unwrap();
    assert_eq!(dec(&balance.bonus), dec("0"));
    assert_eq!(dec(&balance.real), dec("8"));

    // the latest bet for g-1 drew on bonus, so the win is bonus too
    ledger.win(game("4".to_string(), "g-1".to_string())).await.unwrap();
    let balance = ledger.get_balance(USER, CURRENCY).await.unwrap();
    assert_eq!(dec(&balance.bonus), dec("4"));
    assert_eq!(dec(&balance.withdrawable), dec("8"));
}

#[tokio::test]
async fn test_win_on_real_funded_bet_credits_real() {
    let ledger = AssetLedgerService::new(common::store());
    ledger
        .deposit(DepositRequest { entry: entry("10".to_string()), bonus_rate: None })
        .await
        .unwrap();
    ledger.bet(game("5".to_string(), "g-2".to_string())).await.unwrap();
    ledger.win(game("9".to_string(), "g-2".to_string())).await.unwrap();

    let balance = ledger.get_balance(USER, CURRENCY).await.unwrap();
    assert_eq!(dec(&balance.real), dec("14"));
    assert_eq!(dec(&balance.bonus), dec("0"));
}

#[tokio::test]
async fn test_refund_reverses_split_exactly_once() {
    let ledger = AssetLedgerService::new(common::store());
    ledger
        .deposit(DepositRequest { entry: entry("10".to_string()), bonus_rate: Some("0.2".to_string()) })
        .await
        .unwrap();
    ledger.bet(game("5".to_string(), "g-3".to_string())).await.unwrap();

    let refund = RefundRequest {
        user_id: USER.to_string(),
        currency: CURRENCY.to_string(),
        game_id: "g-3".to_string(),
        description: None,
    };
    ledger.refund(refund.clone()).await.unwrap();

    let balance = ledger.get_balance(USER, CURRENCY).await.unwrap();
    assert_eq!(dec(&balance.real), dec("10"));
    assert_eq!(dec(&balance.bonus), dec("2"));

    let err = ledger.refund(refund).await.unwrap_err();
    assert!(matches!(err, LedgerError::BetNotFound(_)));
}

#[tokio::test]
async fn test_every_bet_in_a_round_is_refunded_newest_first() {
    let ledger = AssetLedgerService::new(common::store());
    ledger
        .deposit(DepositRequest { entry: entry("100".to_string()), bonus_rate: None })
        .await
        .unwrap();
    ledger.bet(game("10".to_string(), "g-4".to_string())).await.unwrap();
    ledger.bet(game("20".to_string(), "g-4".to_string())).await.unwrap();

    let refund = RefundRequest {
        user_id: USER.to_string(),
        currency: CURRENCY.to_string(),
        game_id: "g-4".to_string(),
        description: None,
    };

    let first = ledger.refund(refund.clone()).await.unwrap();
    assert_eq!(first[0].amount, dec("20"));
    let second = ledger.refund(refund.clone()).await.unwrap();
    assert_eq!(second[0].amount, dec("10"));
    assert_ne!(first[0].metadata, second[0].metadata);

    let balance = ledger.get_balance(USER, CURRENCY).await.unwrap();
    assert_eq!(dec(&balance.real), dec("100"));

    let err = ledger.refund(refund).await.unwrap_err();
    assert!(matches!(err, LedgerError::BetNotFound(_)));
}

#[tokio::test]
async fn test_balances_are_isolated_per_currency() {
    let ledger = AssetLedgerService::new(common::store());
    ledger
        .deposit(DepositRequest { entry: entry("10".to_string()), bonus_rate: None })
        .await
        .unwrap();

    let mut other = entry("3".to_string());
    other.currency = "BTC".to_string();
    ledger.deposit(DepositRequest { entry: other, bonus_rate: None }).await.unwrap();

    let balances = ledger.list_balances(USER).await.unwrap();
    assert_eq!(balances.len(), 2);

    let page = ledger.transaction_history(USER, Some("BTC"), None, None).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].currency, "BTC");

    let missing = ledger.get_balance(USER, "ETH").await.unwrap();
    assert_eq!(dec(&missing.total), dec("0"));
}
