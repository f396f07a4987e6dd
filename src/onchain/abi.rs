//! Minimal contract bindings for force-resolve and redeem.
//!
//! Only the functions the settlement path touches are declared.

use alloy::sol;

sol! {
    /// UMA oracle request lookup. `requestTimestamp + liveness` is the
    /// moment the question becomes resolvable.
    #[sol(rpc)]
    contract UmaOracle {
        function getRequest(bytes32 questionID)
            external
            view
            returns (uint256 requestTimestamp, uint256 liveness, bytes ancillaryData);
    }

    /// Settles the question into the conditional tokens contract.
    #[sol(rpc)]
    contract UmaCtfAdapter {
        function resolve(bytes32 questionID) external;
    }

    #[sol(rpc)]
    contract ConditionalTokens {
        function redeemPositions(
            address collateralToken,
            bytes32 parentCollectionId,
            bytes32 conditionId,
            uint256[] calldata indexSets
        ) external;

        /// Non-zero once the condition has a reported payout.
        function payoutDenominator(bytes32 conditionId) external view returns (uint256);
    }
}
