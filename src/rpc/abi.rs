//! Solidity bindings for the vault contract.

use alloy_sol_types::sol;

sol! {
    /// Emitted for every accepted deposit
    #[derive(Debug, PartialEq, Eq)]
    event Deposit(address indexed user, uint256 amount);

    /// Emitted for every completed withdrawal
    #[derive(Debug, PartialEq, Eq)]
    event Withdrawal(address indexed user, uint256 amount);

    #[derive(Debug, PartialEq, Eq)]
    function deposit() external payable;

    #[derive(Debug, PartialEq, Eq)]
    function withdraw(uint256 amount) external;

    /// Vault balance credited to `user`
    #[derive(Debug, PartialEq, Eq)]
    function getBalance(address user) external view returns (uint256);

    #[derive(Debug, PartialEq, Eq)]
    function owner() external view returns (address);
}
