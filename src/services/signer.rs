//! EIP-712 typed-data authorizations for the vault contract.
//!
//! The signed struct binds `{systemId, deadline, user, token, amount}`; the
//! vault contract recovers the signer on-chain and rejects the transfer after
//! `deadline`.

use alloy::primitives::{Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol_types::{Eip712Domain, SolStruct};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::str::FromStr;
use thiserror::Error;

use crate::domain::money;
use crate::domain::OrderType;

alloy::sol! {
    struct DepositAuthorization {
        string systemId;
        uint256 deadline;
        address user;
        address token;
        uint256 amount;
    }

    struct WithdrawAuthorization {
        string systemId;
        uint256 deadline;
        address user;
        address token;
        uint256 amount;
    }
}

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("invalid {field} address '{value}'")]
    InvalidAddress { field: &'static str, value: String },

    #[error("amount {amount} is not representable with {decimals} token decimals")]
    AmountPrecision { amount: BigDecimal, decimals: u8 },

    #[error("signing failed: {0}")]
    Signing(String),
}

/// Everything bound into one authorization.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest<'a> {
    pub kind: OrderType,
    pub order_id: &'a str,
    pub deadline: i64,
    pub wallet: &'a str,
    pub token: &'a str,
    pub amount: &'a BigDecimal,
    pub decimals: u8,
    pub chain_id: i64,
    pub vault_contract: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedAuthorization {
    pub signature: String,
    pub contract: String,
    pub system_id: String,
    pub order_id: String,
    pub deadline: i64,
    pub user: String,
    pub token: String,
    /// Token base units.
    pub amount: String,
    /// Amount in currency units.
    pub value: String,
    pub chain_id: i64,
}

pub struct TypedDataSigner {
    signer: PrivateKeySigner,
    domain_name: String,
    domain_version: String,
}

fn parse_address(field: &'static str, value: &str) -> Result<Address, SignerError> {
    Address::from_str(value.trim()).map_err(|_| SignerError::InvalidAddress {
        field,
        value: value.to_string(),
    })
}

impl TypedDataSigner {
    pub fn new(private_key: &str, domain_name: &str, domain_version: &str) -> Result<Self, SignerError> {
        let signer = PrivateKeySigner::from_str(private_key.trim())
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self {
            signer,
            domain_name: domain_name.to_string(),
            domain_version: domain_version.to_string(),
        })
    }

    /// Address the vault contract must trust.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    fn domain(&self, chain_id: i64, vault: Address) -> Eip712Domain {
        Eip712Domain::new(
            Some(Cow::Owned(self.domain_name.clone())),
            Some(Cow::Owned(self.domain_version.clone())),
            Some(U256::from(chain_id as u64)),
            Some(vault),
            None,
        )
    }

    /// Digest the contract recomputes for `request`, plus the base-unit amount.
    pub fn signing_hash(&self, request: &AuthorizationRequest<'_>) -> Result<(B256, String), SignerError> {
        let vault = parse_address("contract", request.vault_contract)?;
        let user = parse_address("wallet", request.wallet)?;
        let token = parse_address("token", request.token)?;
        let units = money::to_base_units(request.amount, request.decimals).ok_or_else(|| {
            SignerError::AmountPrecision {
                amount: request.amount.clone(),
                decimals: request.decimals,
            }
        })?;
        let amount = U256::from_str_radix(&units, 10).map_err(|e| SignerError::Signing(e.to_string()))?;
        let deadline = U256::from(request.deadline.max(0) as u64);
        let domain = self.domain(request.chain_id, vault);

        let hash = match request.kind {
            OrderType::Deposit => DepositAuthorization {
                systemId: request.order_id.to_string(),
                deadline,
                user,
                token,
                amount,
            }
            .eip712_signing_hash(&domain),
            OrderType::Withdraw => WithdrawAuthorization {
                systemId: request.order_id.to_string(),
                deadline,
                user,
                token,
                amount,
            }
            .eip712_signing_hash(&domain),
        };

        Ok((hash, units))
    }

    pub fn sign(&self, request: &AuthorizationRequest<'_>) -> Result<SignedAuthorization, SignerError> {
        let (hash, units) = self.signing_hash(request)?;
        let signature = self
            .signer
            .sign_hash_sync(&hash)
            .map_err(|e| SignerError::Signing(e.to_string()))?;

        Ok(SignedAuthorization {
            signature: format!("0x{}", hex::encode(signature.as_bytes())),
            contract: request.vault_contract.to_string(),
            system_id: request.order_id.to_string(),
            order_id: request.order_id.to_string(),
            deadline: request.deadline,
            user: request.wallet.to_string(),
            token: request.token.to_string(),
            amount: units,
            value: request.amount.normalized().to_string(),
            chain_id: request.chain_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Signature;

    // well-known development key, never funded
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const VAULT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";
    const WALLET: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";
    const TOKEN: &str = "0xdAC17F958D2ee523a2206206994597C13D831ec7";

    fn request<'a>(amount: &'a BigDecimal, kind: OrderType) -> AuthorizationRequest<'a> {
        AuthorizationRequest {
            kind,
            order_id: "order-42",
            deadline: 1_700_000_300,
            wallet: WALLET,
            token: TOKEN,
            amount,
            decimals: 6,
            chain_id: 56,
            vault_contract: VAULT,
        }
    }

    fn signer() -> TypedDataSigner {
        TypedDataSigner::new(TEST_KEY, "AssetVault", "1").unwrap()
    }

    #[test]
    fn test_signature_recovers_to_signer() {
        let signer = signer();
        let amount = BigDecimal::from_str("12.5").unwrap();
        let req = request(&amount, OrderType::Deposit);
        let auth = signer.sign(&req).unwrap();

        assert_eq!(auth.amount, "12500000");
        assert_eq!(auth.value, "12.5");
        assert_eq!(auth.system_id, "order-42");
        assert_eq!(auth.signature.len(), 2 + 65 * 2);

        let bytes = hex::decode(auth.signature.trim_start_matches("0x")).unwrap();
        let signature = Signature::from_raw(&bytes).unwrap();
        let (hash, _) = signer.signing_hash(&req).unwrap();
        assert_eq!(signature.recover_address_from_prehash(&hash).unwrap(), signer.address());
    }

    #[test]
    fn test_deposit_and_withdraw_digests_differ() {
        let signer = signer();
        let amount = BigDecimal::from(1);
        let (deposit, _) = signer.signing_hash(&request(&amount, OrderType::Deposit)).unwrap();
        let (withdraw, _) = signer.signing_hash(&request(&amount, OrderType::Withdraw)).unwrap();
        assert_ne!(deposit, withdraw);
    }

    #[test]
    fn test_rejects_sub_unit_amounts_and_bad_addresses() {
        let signer = signer();
        let tiny = BigDecimal::from_str("0.0000001").unwrap();
        assert!(matches!(
            signer.sign(&request(&tiny, OrderType::Deposit)),
            Err(SignerError::AmountPrecision { .. })
        ));

        let amount = BigDecimal::from(1);
        let mut bad = request(&amount, OrderType::Deposit);
        bad.wallet = "not-an-address";
        assert!(matches!(
            signer.sign(&bad),
            Err(SignerError::InvalidAddress { field: "wallet", .. })
        ));
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        assert!(matches!(
            TypedDataSigner::new("0x1234", "AssetVault", "1"),
            Err(SignerError::InvalidKey(_))
        ));
    }
}
